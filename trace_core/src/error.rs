use std::result::Result as StdResult;
use thiserror::Error;

use crate::decode::DecodeError;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// 报文段长度或头部不合法, 不会进入分类器
    #[error("malformed segment: {0}")]
    MalformedSegment(String),

    /// 内部不变量被破坏, 说明是实现错误而不是输入错误
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("flow table is full ({limit} flows)")]
    CapacityExceeded { limit: usize },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrackerError {
    /// Errors that indicate a bug rather than bad data.
    pub fn is_internal(&self) -> bool {
        matches!(self, TrackerError::InternalInconsistency(_))
    }
}

pub type Result<T> = StdResult<T, TrackerError>;
