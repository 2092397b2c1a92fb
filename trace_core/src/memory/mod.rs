mod pool;

pub use pool::{FlowHandle, FlowPool, FlowPoolConfig};
