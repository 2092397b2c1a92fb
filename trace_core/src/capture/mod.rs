mod savefile;

pub use savefile::{SavefileReader, SavefileRecord};
