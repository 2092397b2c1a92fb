pub mod avl;
pub mod capture;
pub mod config;
pub mod decode;
pub mod error;
pub mod memory;
pub mod stream;
pub mod util;

// 重新导出常用类型
pub use avl::AvlTree;
pub use capture::{SavefileReader, SavefileRecord};
pub use config::{CapacityPolicy, TrackerConfig, TrackerMode};
pub use decode::{DecodeContext, DecodeError, PacketRecord, TcpFlags, TcpOptions, Timestamp};
pub use error::{Result, TrackerError};
pub use memory::{FlowHandle, FlowPool};
pub use stream::{
    AckClass, ConnectionTracker, Direction, Flow, FlowKey, FlowSummary, PacketEvent, SequenceSpace,
    TrackerStats,
};
pub use util::log::init_logger;
