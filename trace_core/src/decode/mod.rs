mod decode;
mod decode_context;
mod decode_tcp;
mod error;

pub use decode::{
    decode_ethernet, decode_ip, decode_link, PacketRecord, Timestamp, LINKTYPE_ETHERNET,
    LINKTYPE_RAW, LINKTYPE_RAW_ALT,
};
pub use decode_context::{DecodeContext, DecodeStats};
pub use decode_tcp::{
    decode_tcp, SackBlock, TcpFlags, TcpHeader, TcpOptions, TCP_ACK, TCP_FIN, TCP_PSH, TCP_RST,
    TCP_SYN, TCP_URG,
};
pub use error::{DecodeError, DecodeResult, IpHeaderError, TcpHeaderError};
