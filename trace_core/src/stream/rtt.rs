use std::collections::VecDeque;
use std::time::Duration;

use log::trace;
use serde::Serialize;

use super::seqspace::{seq_geq, seq_gt, seq_leq, seq_lt};
use crate::decode::Timestamp;

/// 已发送但尚未确认的数据段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingSegment {
    pub seq: u32,
    /// 恰好确认本段的 ACK 值, 即 seq + len
    pub ackedby: u32,
    /// 最近一次发送的时间, 重传时更新
    pub sent: Timestamp,
    pub retrans: u32,
}

/// How one incoming ACK was matched against the outstanding segments of the
/// direction it acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum AckClass {
    /// Exactly acknowledges a segment sent once; yields an RTT sample.
    Normal { rtt_us: u64 },
    /// Covers outstanding segments without matching one exactly.
    Cumulative,
    /// Exactly acknowledges a retransmitted segment. The sample is measured
    /// against the last transmission and kept apart from the primary stats.
    Ambiguous { rtt_us: u64 },
    /// Exact match, but a segment covered by the same ACK went out later.
    NoSample,
    /// Pure ACK repeating the previous ACK value.
    Duplicate { repeats: u32 },
    /// Acknowledges the SYN; the sample goes to the handshake RTT.
    Handshake { rtt_us: u64 },
    Unknown,
}

impl AckClass {
    pub fn rtt_sample(&self) -> Option<Duration> {
        match self {
            AckClass::Normal { rtt_us } => Some(Duration::from_micros(*rtt_us)),
            _ => None,
        }
    }
}

/// Running RTT statistics in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RttStats {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub sum_us: u64,
    pub sum2_us: f64,
}

impl RttStats {
    pub fn add(&mut self, sample: Duration) {
        let us = u64::try_from(sample.as_micros()).unwrap_or(u64::MAX);
        if self.count == 0 || us < self.min_us {
            self.min_us = us;
        }
        if us > self.max_us {
            self.max_us = us;
        }
        self.count += 1;
        self.sum_us = self.sum_us.saturating_add(us);
        self.sum2_us += (us as f64) * (us as f64);
    }

    pub fn avg_us(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum_us as f64 / self.count as f64)
    }

    /// Sample standard deviation; needs at least two samples.
    pub fn stdev_us(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let n = self.count as f64;
        let sum = self.sum_us as f64;
        let var = (self.sum2_us - sum * sum / n) / (n - 1.0);
        Some(var.max(0.0).sqrt())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AckCounters {
    pub normal: u64,
    pub cumulative: u64,
    pub ambiguous: u64,
    pub nosample: u64,
    pub duplicate: u64,
    pub triple_duplicate: u64,
    pub unknown: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingSyn {
    isn: u32,
    sent: Timestamp,
}

/// Per-direction RTT bookkeeping. Segments are recorded as the direction
/// sends them; ACKs travelling the other way are fed to `ack_in`.
#[derive(Debug, Default)]
pub struct AckTracker {
    outstanding: VecDeque<OutstandingSegment>,
    rtt: RttStats,
    rtt_last: RttStats,
    rtt_3whs: Option<Duration>,
    pending_syn: Option<PendingSyn>,
    counters: AckCounters,
    last_sample: Option<Duration>,
    dup_repeats: u32,
    highest_acked: Option<u32>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录 SYN 的发送, 重复的 SYN 刷新发送时间
    pub fn record_syn(&mut self, isn: u32, now: Timestamp) {
        if self.rtt_3whs.is_some() {
            return;
        }
        self.pending_syn = Some(PendingSyn { isn, sent: now });
    }

    /// Records `len` data bytes starting at `seq`. A resend of a segment
    /// already outstanding bumps its retransmit count and send time.
    pub fn record_send(&mut self, seq: u32, len: u32, now: Timestamp) {
        if len == 0 {
            return;
        }
        let ackedby = seq.wrapping_add(len);
        if let Some(seg) = self.outstanding.iter_mut().rev().find(|s| s.seq == seq) {
            seg.retrans += 1;
            seg.sent = now;
            if seq_gt(ackedby, seg.ackedby) {
                seg.ackedby = ackedby;
            }
            trace!("resend seq={} retrans={}", seq, seg.retrans);
            return;
        }
        if let Some(acked) = self.highest_acked {
            // 已确认的数据重传, 没有可匹配的 ACK
            if seq_leq(ackedby, acked) {
                return;
            }
        }
        let pos = self
            .outstanding
            .iter()
            .rposition(|s| seq_lt(s.seq, seq))
            .map_or(0, |ix| ix + 1);
        self.outstanding.insert(
            pos,
            OutstandingSegment {
                seq,
                ackedby,
                sent: now,
                retrans: 0,
            },
        );
    }

    /// Classifies an ACK for data this direction sent. `prev_ack` is the
    /// previous ACK value carried by the acking direction and `pure_ack`
    /// tells whether this packet carries no data, SYN or FIN.
    pub fn ack_in(
        &mut self,
        ack: u32,
        now: Timestamp,
        prev_ack: Option<u32>,
        pure_ack: bool,
    ) -> AckClass {
        let mut exact: Option<OutstandingSegment> = None;
        let mut exact_count = 0u32;
        let mut latest_other: Option<Timestamp> = None;
        let mut covered = 0usize;

        // 列表按 seq 排序, 起点不早于 ack 的段不可能被确认
        let candidates = self
            .outstanding
            .iter()
            .position(|seg| seq_geq(seg.seq, ack))
            .unwrap_or(self.outstanding.len());
        let mut kept = Vec::new();
        for seg in self.outstanding.drain(..candidates) {
            if !seq_leq(seg.ackedby, ack) {
                kept.push(seg);
                continue;
            }
            covered += 1;
            if seg.ackedby == ack {
                exact_count += 1;
                if let Some(prev) = exact.replace(seg) {
                    latest_other = latest_other.max(Some(prev.sent));
                }
            } else {
                latest_other = latest_other.max(Some(seg.sent));
            }
        }
        for seg in kept.into_iter().rev() {
            self.outstanding.push_front(seg);
        }

        if covered > 0 {
            self.dup_repeats = 0;
            if self.highest_acked.map_or(true, |h| seq_gt(ack, h)) {
                self.highest_acked = Some(ack);
            }
        }

        let class = match exact {
            Some(seg) => {
                let rtt = now.saturating_since(seg.sent);
                let rtt_us = u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX);
                if seg.retrans > 0 || exact_count > 1 {
                    self.rtt_last.add(rtt);
                    self.counters.ambiguous += 1;
                    AckClass::Ambiguous { rtt_us }
                } else if latest_other.is_some_and(|t| t > seg.sent) {
                    self.counters.nosample += 1;
                    AckClass::NoSample
                } else {
                    self.rtt.add(rtt);
                    self.last_sample = Some(rtt);
                    self.counters.normal += 1;
                    AckClass::Normal { rtt_us }
                }
            }
            None if covered > 0 => {
                self.counters.cumulative += 1;
                AckClass::Cumulative
            }
            None => self.unmatched(ack, now, prev_ack, pure_ack),
        };
        trace!("ack {} -> {:?} ({} outstanding)", ack, class, self.outstanding.len());
        class
    }

    fn unmatched(
        &mut self,
        ack: u32,
        now: Timestamp,
        prev_ack: Option<u32>,
        pure_ack: bool,
    ) -> AckClass {
        if let Some(syn) = self.pending_syn {
            if ack == syn.isn.wrapping_add(1) {
                let rtt = now.saturating_since(syn.sent);
                self.rtt_3whs = Some(rtt);
                self.pending_syn = None;
                self.dup_repeats = 0;
                return AckClass::Handshake {
                    rtt_us: u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX),
                };
            }
        }
        if pure_ack && prev_ack == Some(ack) {
            self.dup_repeats += 1;
            self.counters.duplicate += 1;
            if self.dup_repeats == 3 {
                self.counters.triple_duplicate += 1;
            }
            return AckClass::Duplicate {
                repeats: self.dup_repeats,
            };
        }
        self.dup_repeats = 0;
        self.counters.unknown += 1;
        AckClass::Unknown
    }

    pub fn outstanding(&self) -> impl Iterator<Item = &OutstandingSegment> {
        self.outstanding.iter()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn rtt(&self) -> &RttStats {
        &self.rtt
    }

    pub fn rtt_last(&self) -> &RttStats {
        &self.rtt_last
    }

    pub fn rtt_3whs(&self) -> Option<Duration> {
        self.rtt_3whs
    }

    pub fn last_sample(&self) -> Option<Duration> {
        self.last_sample
    }

    pub fn counters(&self) -> &AckCounters {
        &self.counters
    }

    pub fn dup_repeats(&self) -> u32 {
        self.dup_repeats
    }

    /// 释放未确认段列表
    pub fn clear(&mut self) {
        self.outstanding.clear();
        self.pending_syn = None;
    }
}
