use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use log::trace;
use serde::Serialize;

use super::decode_tcp::{decode_tcp, TcpFlags, TcpOptions};
use super::error::{DecodeError, DecodeResult, IpHeaderError};
use crate::error::{Result, TrackerError};

pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW: u32 = 101;
/// Some BSDs write raw IP as 12.
pub const LINKTYPE_RAW_ALT: u32 = 12;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERNET_HEADER: usize = 14;

const IPPROTO_TCP: u8 = 6;
const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

// IPv6 扩展头
const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_DEST_OPTS: u8 = 60;

/// 抓包时间戳, 自 epoch 起的微秒数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    pub const fn from_secs_micros(secs: u64, micros: u32) -> Self {
        Timestamp(secs * 1_000_000 + micros as u64)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Timestamp((secs * 1_000_000.0).round() as u64)
    }

    pub fn as_micros(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Elapsed time since `earlier`, zero when the trace runs backwards.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    pub fn checked_add(self, delta: Duration) -> Option<Timestamp> {
        let micros = u64::try_from(delta.as_micros()).ok()?;
        self.0.checked_add(micros).map(Timestamp)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// A TCP segment as the tracker sees it. Producing this from wire bytes is
/// the decoder's job; the tracker never looks at raw packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub timestamp: Timestamp,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub options: TcpOptions,
    /// TCP payload length claimed by the IP header
    pub payload_len: u32,
    /// payload bytes actually present in the capture
    pub captured_payload: u32,
}

impl PacketRecord {
    pub fn new(timestamp: Timestamp, src: SocketAddr, dst: SocketAddr, flags: TcpFlags) -> Self {
        Self {
            timestamp,
            src,
            dst,
            flags,
            seq: 0,
            ack: 0,
            window: 65535,
            options: TcpOptions::default(),
            payload_len: 0,
            captured_payload: 0,
        }
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    pub fn with_payload(mut self, len: u32) -> Self {
        self.payload_len = len;
        self.captured_payload = len;
        self
    }

    /// Marks only the first `len` payload bytes as captured (snaplen cut).
    pub fn with_captured(mut self, len: u32) -> Self {
        self.captured_payload = len;
        self
    }

    pub fn with_options(mut self, options: TcpOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_truncated(&self) -> bool {
        self.captured_payload < self.payload_len
    }

    /// A segment may never claim to carry more than half the sequence space.
    pub fn validate(&self) -> Result<()> {
        if self.captured_payload > self.payload_len {
            return Err(TrackerError::MalformedSegment(format!(
                "captured {} payload bytes of a {} byte segment",
                self.captured_payload, self.payload_len
            )));
        }
        if self.payload_len > i32::MAX as u32 {
            return Err(TrackerError::MalformedSegment(format!(
                "impossible payload length {}",
                self.payload_len
            )));
        }
        Ok(())
    }
}

/// Decodes an IPv4 or IPv6 datagram carrying TCP.
pub fn decode_ip(timestamp: Timestamp, buffer: &[u8]) -> DecodeResult<PacketRecord> {
    let first = *buffer.first().ok_or(DecodeError::EmptyPacket)?;
    match first >> 4 {
        4 => decode_ipv4(timestamp, buffer),
        6 => decode_ipv6(timestamp, buffer),
        version => Err(IpHeaderError::UnsupportedVersion { version }.into()),
    }
}

fn decode_ipv4(timestamp: Timestamp, buffer: &[u8]) -> DecodeResult<PacketRecord> {
    if buffer.len() < IPV4_MIN_HEADER {
        return Err(IpHeaderError::TooShort.into());
    }
    let ihl = (buffer[0] & 0x0f) as usize * 4;
    let total_length = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
    if ihl < IPV4_MIN_HEADER || buffer.len() < ihl {
        return Err(IpHeaderError::TooShort.into());
    }
    if total_length < ihl {
        return Err(IpHeaderError::InvalidTotalLength {
            length: total_length as u32,
        }
        .into());
    }
    let fragment_offset = u16::from_be_bytes([buffer[6], buffer[7]]) & 0x1fff;
    if fragment_offset != 0 {
        return Err(IpHeaderError::Fragmented {
            offset: fragment_offset,
        }
        .into());
    }
    let protocol = buffer[9];
    if protocol != IPPROTO_TCP {
        return Err(DecodeError::UnsupportedProtocol { protocol });
    }

    let src = Ipv4Addr::new(buffer[12], buffer[13], buffer[14], buffer[15]);
    let dst = Ipv4Addr::new(buffer[16], buffer[17], buffer[18], buffer[19]);
    build_record(
        timestamp,
        IpAddr::V4(src),
        IpAddr::V4(dst),
        &buffer[ihl..],
        total_length - ihl,
    )
}

fn decode_ipv6(timestamp: Timestamp, buffer: &[u8]) -> DecodeResult<PacketRecord> {
    if buffer.len() < IPV6_HEADER {
        return Err(IpHeaderError::TooShort.into());
    }
    let payload_length = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
    let mut next_header = buffer[6];
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&buffer[8..24]);
    dst.copy_from_slice(&buffer[24..40]);

    // 跳过扩展头
    let mut offset = IPV6_HEADER;
    let end = IPV6_HEADER + payload_length;
    loop {
        match next_header {
            IPPROTO_TCP => break,
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTS => {
                if buffer.len() < offset + 8 {
                    return Err(IpHeaderError::TooShort.into());
                }
                next_header = buffer[offset];
                offset += (buffer[offset + 1] as usize + 1) * 8;
            }
            IPV6_FRAGMENT => {
                if buffer.len() < offset + 8 {
                    return Err(IpHeaderError::TooShort.into());
                }
                let fragment_offset =
                    u16::from_be_bytes([buffer[offset + 2], buffer[offset + 3]]) >> 3;
                return Err(IpHeaderError::Fragmented {
                    offset: fragment_offset,
                }
                .into());
            }
            protocol => return Err(DecodeError::UnsupportedProtocol { protocol }),
        }
        if offset > end {
            return Err(IpHeaderError::InvalidTotalLength {
                length: payload_length as u32,
            }
            .into());
        }
    }
    if buffer.len() < offset {
        return Err(IpHeaderError::TooShort.into());
    }

    build_record(
        timestamp,
        IpAddr::V6(Ipv6Addr::from(src)),
        IpAddr::V6(Ipv6Addr::from(dst)),
        &buffer[offset..],
        end - offset,
    )
}

fn build_record(
    timestamp: Timestamp,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    segment: &[u8],
    segment_len: usize,
) -> DecodeResult<PacketRecord> {
    let tcp = decode_tcp(segment, segment_len)?;
    let payload_len = segment_len - tcp.header_len;
    let captured = segment.len().saturating_sub(tcp.header_len).min(payload_len);
    Ok(PacketRecord {
        timestamp,
        src: SocketAddr::new(src_ip, tcp.src_port),
        dst: SocketAddr::new(dst_ip, tcp.dst_port),
        flags: tcp.flags,
        seq: tcp.seq,
        ack: tcp.ack,
        window: tcp.window,
        options: tcp.options,
        payload_len: payload_len as u32,
        captured_payload: captured as u32,
    })
}

/// Decodes an Ethernet II frame, stepping over a single 802.1Q tag.
pub fn decode_ethernet(timestamp: Timestamp, frame: &[u8]) -> DecodeResult<PacketRecord> {
    if frame.len() < ETHERNET_HEADER {
        return Err(DecodeError::InsufficientLength {
            required: ETHERNET_HEADER,
            actual: frame.len(),
        });
    }
    let mut offset = 12;
    let mut ethertype = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < ETHERNET_HEADER + 4 {
            return Err(DecodeError::InsufficientLength {
                required: ETHERNET_HEADER + 4,
                actual: frame.len(),
            });
        }
        offset += 4;
        ethertype = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
    }
    trace!("ethernet frame: ethertype={:#06x} len={}", ethertype, frame.len());
    match ethertype {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => decode_ip(timestamp, &frame[offset + 2..]),
        _ => Err(DecodeError::UnsupportedEtherType { ethertype }),
    }
}

pub fn decode_link(linktype: u32, timestamp: Timestamp, data: &[u8]) -> DecodeResult<PacketRecord> {
    match linktype {
        LINKTYPE_ETHERNET => decode_ethernet(timestamp, data),
        LINKTYPE_RAW | LINKTYPE_RAW_ALT => decode_ip(timestamp, data),
        _ => Err(DecodeError::UnsupportedLinkType { linktype }),
    }
}
