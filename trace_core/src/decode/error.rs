use thiserror::Error;

/// 解码错误类型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// 数据包为空
    #[error("empty packet")]
    EmptyPacket,

    /// 数据包长度不足
    #[error("packet too short: need {required} bytes, have {actual}")]
    InsufficientLength { required: usize, actual: usize },

    #[error("ip header: {0}")]
    IpHeaderError(#[from] IpHeaderError),

    #[error("tcp header: {0}")]
    TcpHeaderError(#[from] TcpHeaderError),

    /// 不是 TCP
    #[error("unsupported transport protocol {protocol}")]
    UnsupportedProtocol { protocol: u8 },

    #[error("unsupported ethertype {ethertype:#06x}")]
    UnsupportedEtherType { ethertype: u16 },

    #[error("unsupported link type {linktype}")]
    UnsupportedLinkType { linktype: u32 },
}

/// IP头部错误类型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpHeaderError {
    #[error("header too short")]
    TooShort,

    #[error("unsupported ip version {version}")]
    UnsupportedVersion { version: u8 },

    #[error("invalid total length {length}")]
    InvalidTotalLength { length: u32 },

    /// 非首分片不含 TCP 头
    #[error("fragmented datagram (offset {offset})")]
    Fragmented { offset: u16 },
}

/// TCP头部错误类型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TcpHeaderError {
    #[error("header too short")]
    TooShort,

    #[error("invalid data offset {0}")]
    InvalidLength(usize),

    /// 头部长度超过 IP 声明的长度
    #[error("header length {header} exceeds segment length {segment}")]
    ImpossibleLength { header: usize, segment: usize },
}

impl DecodeError {
    /// Critical errors mean the bytes claim to be TCP but cannot be; the
    /// rest are packets the tracker simply has no interest in.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            DecodeError::IpHeaderError(IpHeaderError::InvalidTotalLength { .. })
                | DecodeError::TcpHeaderError(_)
        )
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;
