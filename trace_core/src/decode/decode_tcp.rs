use std::fmt;

use log::trace;
use serde::Serialize;

use super::error::{DecodeResult, TcpHeaderError};

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;

const TCP_MIN_HEADER: usize = 20;

const OPT_EOL: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WSCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_SACK: u8 = 5;
const OPT_TIMESTAMP: u8 = 8;

/// RFC 7323 caps the shift count at 14.
pub const MAX_WINDOW_SCALE: u8 = 14;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(TCP_FIN);
    pub const SYN: TcpFlags = TcpFlags(TCP_SYN);
    pub const RST: TcpFlags = TcpFlags(TCP_RST);
    pub const PSH: TcpFlags = TcpFlags(TCP_PSH);
    pub const ACK: TcpFlags = TcpFlags(TCP_ACK);
    pub const URG: TcpFlags = TcpFlags(TCP_URG);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn syn(self) -> bool {
        self.0 & TCP_SYN != 0
    }

    pub fn fin(self) -> bool {
        self.0 & TCP_FIN != 0
    }

    pub fn rst(self) -> bool {
        self.0 & TCP_RST != 0
    }

    pub fn ack(self) -> bool {
        self.0 & TCP_ACK != 0
    }

    pub fn psh(self) -> bool {
        self.0 & TCP_PSH != 0
    }

    pub fn urg(self) -> bool {
        self.0 & TCP_URG != 0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (TCP_SYN, 'S'),
            (TCP_FIN, 'F'),
            (TCP_RST, 'R'),
            (TCP_PSH, 'P'),
            (TCP_ACK, 'A'),
            (TCP_URG, 'U'),
        ];
        for (bit, name) in names {
            if self.0 & bit != 0 {
                write!(f, "{}", name)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SackBlock {
    pub left: u32,
    pub right: u32,
}

/// The TCP option block, as far as connection tracking cares about it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub sack_blocks: Vec<SackBlock>,
    /// (TSval, TSecr)
    pub timestamp: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub header_len: usize,
    pub options: TcpOptions,
}

/// Parses a TCP header out of `buffer`. `segment_len` is the TCP length the
/// IP layer claims, which may exceed what was captured.
pub fn decode_tcp(buffer: &[u8], segment_len: usize) -> DecodeResult<TcpHeader> {
    if buffer.len() < TCP_MIN_HEADER {
        return Err(TcpHeaderError::TooShort.into());
    }

    let header_len = ((buffer[12] >> 4) & 0x0f) as usize * 4;
    if header_len < TCP_MIN_HEADER {
        return Err(TcpHeaderError::InvalidLength(header_len).into());
    }
    if header_len > segment_len {
        return Err(TcpHeaderError::ImpossibleLength {
            header: header_len,
            segment: segment_len,
        }
        .into());
    }
    if header_len > buffer.len() {
        return Err(TcpHeaderError::TooShort.into());
    }

    let header = TcpHeader {
        src_port: u16::from_be_bytes([buffer[0], buffer[1]]),
        dst_port: u16::from_be_bytes([buffer[2], buffer[3]]),
        seq: u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
        ack: u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]),
        flags: TcpFlags(buffer[13] & 0x3f),
        window: u16::from_be_bytes([buffer[14], buffer[15]]),
        header_len,
        options: parse_options(&buffer[TCP_MIN_HEADER..header_len]),
    };
    trace!(
        "tcp header: {} -> {} seq={} ack={} flags={} win={}",
        header.src_port,
        header.dst_port,
        header.seq,
        header.ack,
        header.flags,
        header.window
    );
    Ok(header)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Malformed options end the walk; whatever was parsed before stays.
fn parse_options(mut bytes: &[u8]) -> TcpOptions {
    let mut options = TcpOptions::default();
    while let Some(&kind) = bytes.first() {
        match kind {
            OPT_EOL => break,
            OPT_NOP => {
                bytes = &bytes[1..];
                continue;
            }
            _ => {}
        }
        let len = match bytes.get(1) {
            Some(&len) if len >= 2 && len as usize <= bytes.len() => len as usize,
            _ => {
                trace!("bad tcp option length for kind {}", kind);
                break;
            }
        };
        let body = &bytes[2..len];
        match (kind, body.len()) {
            (OPT_MSS, 2) => options.mss = Some(u16::from_be_bytes([body[0], body[1]])),
            (OPT_WSCALE, 1) => options.window_scale = Some(body[0].min(MAX_WINDOW_SCALE)),
            (OPT_SACK_PERMITTED, 0) => options.sack_permitted = true,
            (OPT_SACK, n) if n % 8 == 0 => {
                options.sack_blocks = body
                    .chunks_exact(8)
                    .map(|b| SackBlock {
                        left: read_u32(&b[0..4]),
                        right: read_u32(&b[4..8]),
                    })
                    .collect();
            }
            (OPT_TIMESTAMP, 8) => {
                options.timestamp = Some((read_u32(&body[0..4]), read_u32(&body[4..8])));
            }
            _ => {}
        }
        bytes = &bytes[len..];
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeError;

    fn header_with_options(options: &[u8]) -> Vec<u8> {
        let header_len = 20 + options.len();
        let mut data = vec![0u8; header_len];
        data[0..2].copy_from_slice(&1234u16.to_be_bytes());
        data[2..4].copy_from_slice(&80u16.to_be_bytes());
        data[4..8].copy_from_slice(&1000u32.to_be_bytes());
        data[8..12].copy_from_slice(&2000u32.to_be_bytes());
        data[12] = ((header_len / 4) as u8) << 4;
        data[13] = TCP_SYN | TCP_ACK;
        data[14..16].copy_from_slice(&8192u16.to_be_bytes());
        data[20..].copy_from_slice(options);
        data
    }

    #[test]
    fn test_decode_plain_header() {
        let data = header_with_options(&[]);
        let header = decode_tcp(&data, data.len()).unwrap();
        assert_eq!(header.src_port, 1234);
        assert_eq!(header.dst_port, 80);
        assert_eq!(header.seq, 1000);
        assert_eq!(header.ack, 2000);
        assert!(header.flags.syn() && header.flags.ack());
        assert!(!header.flags.fin());
        assert_eq!(header.window, 8192);
        assert_eq!(header.options, TcpOptions::default());
    }

    #[test]
    fn test_decode_options() {
        let options = [
            2, 4, 0x05, 0xb4, // MSS 1460
            1, 3, 3, 7, // NOP, wscale 7
            4, 2, // SACK permitted
            8, 10, 0, 0, 0, 1, 0, 0, 0, 2, // timestamps
        ];
        let data = header_with_options(&options);
        let header = decode_tcp(&data, data.len()).unwrap();
        assert_eq!(header.options.mss, Some(1460));
        assert_eq!(header.options.window_scale, Some(7));
        assert!(header.options.sack_permitted);
        assert_eq!(header.options.timestamp, Some((1, 2)));
    }

    #[test]
    fn test_sack_blocks_and_clamped_scale() {
        let options = [
            1, 1, 5, 10, 0, 0, 0, 10, 0, 0, 0, 20, // one SACK block
            3, 3, 20, 0, // wscale 20 clamps to 14, EOL
        ];
        let data = header_with_options(&options);
        let header = decode_tcp(&data, data.len()).unwrap();
        assert_eq!(header.options.sack_blocks, vec![SackBlock { left: 10, right: 20 }]);
        assert_eq!(header.options.window_scale, Some(MAX_WINDOW_SCALE));
    }

    #[test]
    fn test_bad_option_length_stops_parsing() {
        let options = [2, 4, 0x05, 0xb4, 3, 9, 0, 0];
        let data = header_with_options(&options);
        let header = decode_tcp(&data, data.len()).unwrap();
        assert_eq!(header.options.mss, Some(1460));
        assert_eq!(header.options.window_scale, None);
    }

    #[test]
    fn test_impossible_lengths() {
        let data = header_with_options(&[1, 1, 1, 1]);
        assert!(matches!(
            decode_tcp(&data, 20),
            Err(DecodeError::TcpHeaderError(TcpHeaderError::ImpossibleLength { .. }))
        ));
        let mut short = header_with_options(&[]);
        short[12] = 0x40;
        assert!(matches!(
            decode_tcp(&short, short.len()),
            Err(DecodeError::TcpHeaderError(TcpHeaderError::InvalidLength(16)))
        ));
        assert!(decode_tcp(&short[..10], 40).is_err());
    }

    #[test]
    fn test_flag_display() {
        assert_eq!((TcpFlags::SYN | TcpFlags::ACK).to_string(), "SA");
        assert!((TcpFlags::FIN | TcpFlags::ACK).contains(TcpFlags::FIN));
    }
}
