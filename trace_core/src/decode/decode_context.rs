use log::{debug, warn};
use serde::Serialize;

use super::decode::{decode_link, PacketRecord, Timestamp};
use super::error::DecodeError;

const MAX_KEPT_ERRORS: usize = 64;

#[derive(Default, Debug, Clone, Serialize)]
pub struct DecodeStats {
    pub packets: u64,
    pub tcp_packets: u64,
    pub ipv4_packets: u64,
    pub ipv6_packets: u64,
    pub skipped: u64,
    pub truncated: u64,
    pub errors: u64,
}

/// Running decoder state for one capture: counters plus the first few
/// error messages for the final report.
#[derive(Debug)]
pub struct DecodeContext {
    pub linktype: u32,
    pub stats: DecodeStats,
    pub errors: Vec<String>,
}

impl DecodeContext {
    pub fn new(linktype: u32) -> Self {
        Self {
            linktype,
            stats: DecodeStats::default(),
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, err: &DecodeError) {
        self.stats.errors += 1;
        if self.errors.len() < MAX_KEPT_ERRORS {
            self.errors.push(err.to_string());
        }
    }

    /// Non-TCP traffic is counted and dropped; broken TCP is logged.
    pub fn decode(&mut self, timestamp: Timestamp, data: &[u8]) -> Option<PacketRecord> {
        self.stats.packets += 1;
        match decode_link(self.linktype, timestamp, data) {
            Ok(record) => {
                self.stats.tcp_packets += 1;
                if record.src.is_ipv4() {
                    self.stats.ipv4_packets += 1;
                } else {
                    self.stats.ipv6_packets += 1;
                }
                if record.is_truncated() {
                    self.stats.truncated += 1;
                }
                Some(record)
            }
            Err(err) if err.is_critical() => {
                warn!("packet {} at {}: {}", self.stats.packets, timestamp, err);
                self.record_error(&err);
                None
            }
            Err(err) => {
                debug!("packet {} skipped: {}", self.stats.packets, err);
                self.stats.skipped += 1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{LINKTYPE_RAW, TcpHeaderError};

    #[test]
    fn test_context_counts() {
        let mut ctx = DecodeContext::new(LINKTYPE_RAW);
        let mut good = vec![0u8; 40];
        good[0] = 0x45;
        good[2..4].copy_from_slice(&40u16.to_be_bytes());
        good[9] = 6;
        good[32] = 0x50;
        assert!(ctx.decode(Timestamp::default(), &good).is_some());

        let mut udp = good.clone();
        udp[9] = 17;
        assert!(ctx.decode(Timestamp::default(), &udp).is_none());

        let mut broken = good.clone();
        broken[32] = 0x30;
        assert!(ctx.decode(Timestamp::default(), &broken).is_none());

        assert_eq!(ctx.stats.packets, 3);
        assert_eq!(ctx.stats.tcp_packets, 1);
        assert_eq!(ctx.stats.ipv4_packets, 1);
        assert_eq!(ctx.stats.skipped, 1);
        assert_eq!(ctx.stats.errors, 1);
        assert_eq!(
            ctx.errors[0],
            DecodeError::from(TcpHeaderError::InvalidLength(12)).to_string()
        );
    }
}
