use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use fxhash::FxHasher64;
use serde::Serialize;

use super::rtt::{AckCounters, AckTracker, RttStats};
use super::seqspace::{seq_gt, SequenceSpace, SpaceSummary};
use crate::decode::{TcpOptions, Timestamp};

/// 流的方向: A 为首个报文的源端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    AtoB,
    BtoA,
}

impl Direction {
    pub fn reverse(self) -> Direction {
        match self {
            Direction::AtoB => Direction::BtoA,
            Direction::BtoA => Direction::AtoB,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AtoB => write!(f, "a2b"),
            Direction::BtoA => write!(f, "b2a"),
        }
    }
}

/// The unordered endpoint pair of a connection.
///
/// `a` is whichever endpoint sent the first packet seen; equality, ordering
/// and hashing ignore that orientation so a packet in either direction
/// finds the same key. Ordering compares the precomputed hash first, then
/// the endpoints, which is what the snapshot index sorts by.
#[derive(Debug, Clone, Copy)]
pub struct FlowKey {
    a: SocketAddr,
    b: SocketAddr,
    hash: u64,
}

impl FlowKey {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        let (low, high) = if src <= dst { (src, dst) } else { (dst, src) };
        let mut hasher = FxHasher64::default();
        low.hash(&mut hasher);
        high.hash(&mut hasher);
        Self {
            a: src,
            b: dst,
            hash: hasher.finish(),
        }
    }

    pub fn a(&self) -> SocketAddr {
        self.a
    }

    pub fn b(&self) -> SocketAddr {
        self.b
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    pub fn bucket(&self, buckets: usize) -> usize {
        (self.hash % buckets.max(1) as u64) as usize
    }

    fn ordered(&self) -> (SocketAddr, SocketAddr) {
        if self.a <= self.b {
            (self.a, self.b)
        } else {
            (self.b, self.a)
        }
    }

    /// Which direction a packet `src -> dst` travels in, if it belongs here.
    pub fn direction_of(&self, src: SocketAddr, dst: SocketAddr) -> Option<Direction> {
        if src == self.a && dst == self.b {
            Some(Direction::AtoB)
        } else if src == self.b && dst == self.a {
            Some(Direction::BtoA)
        } else {
            None
        }
    }
}

impl PartialEq for FlowKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.ordered() == other.ordered()
    }
}

impl Eq for FlowKey {}

impl PartialOrd for FlowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.ordered().cmp(&other.ordered()))
    }
}

impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.ordered().hash(state);
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.a, self.b)
    }
}

/// 单个方向的状态 (tcb)
#[derive(Debug, Default)]
pub struct DirectionState {
    /// 报文数
    pub packets: u64,
    /// 携带数据的报文数
    pub data_packets: u64,
    /// 数据字节数, 含重传
    pub data_bytes: u64,
    /// 首次发送的字节数
    pub unique_bytes: u64,
    pub rexmit_packets: u64,
    pub rexmit_bytes: u64,
    pub out_of_order: u64,
    pub pure_acks: u64,
    /// 抓包截断的报文数
    pub truncated: u64,
    pub syn_count: u32,
    pub fin_count: u32,
    pub rst_count: u32,
    /// SYN 携带的初始序列号
    pub syn: Option<u32>,
    /// FIN 所在的序列号
    pub fin: Option<u32>,
    /// 最近一个报文的序列号
    pub latest_seq: Option<u32>,
    /// 已发送数据的最高端 (下一个新字节)
    pub max_seq: Option<u32>,
    /// 本方向发出的最后一个 ACK
    pub ack: Option<u32>,
    /// 对端 ACK 加上对端通告窗口, 本方向可发送的右边界
    pub windowend: Option<u32>,
    pub window_scale: Option<u8>,
    pub mss: Option<u16>,
    pub sack_permitted: bool,
    pub sack_blocks: u64,
    pub timestamps_seen: bool,
    pub win_min: Option<u32>,
    pub win_max: Option<u32>,
    pub win_last: Option<u32>,
    pub zero_windows: u64,
    pub first_rexmit: Option<Timestamp>,
    pub last_rexmit: Option<Timestamp>,
    pub first_time: Option<Timestamp>,
    pub last_time: Option<Timestamp>,
    pub space: SequenceSpace,
    pub rtt: AckTracker,
}

impl DirectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_options(&mut self, options: &TcpOptions, syn: bool) {
        if syn {
            if options.mss.is_some() {
                self.mss = options.mss;
            }
            if options.window_scale.is_some() {
                self.window_scale = options.window_scale;
            }
            self.sack_permitted |= options.sack_permitted;
        }
        self.sack_blocks += options.sack_blocks.len() as u64;
        self.timestamps_seen |= options.timestamp.is_some();
    }

    pub fn note_window(&mut self, effective: u32) {
        self.win_min = Some(self.win_min.map_or(effective, |w| w.min(effective)));
        self.win_max = Some(self.win_max.map_or(effective, |w| w.max(effective)));
        self.win_last = Some(effective);
        if effective == 0 {
            self.zero_windows += 1;
        }
    }

    /// 推进已发送的最高序列号
    pub fn advance_max_seq(&mut self, end: u32) {
        match self.max_seq {
            Some(max) if !seq_gt(end, max) => {}
            _ => self.max_seq = Some(end),
        }
    }

    pub fn note_rexmit(&mut self, now: Timestamp) {
        self.first_rexmit.get_or_insert(now);
        self.last_rexmit = Some(now);
    }

    /// Unique bytes per second over the flow's lifetime.
    pub fn throughput(&self, duration_secs: f64) -> f64 {
        if duration_secs <= 0.0 {
            return 0.0;
        }
        self.unique_bytes as f64 / duration_secs
    }

    /// Drops the sequence space and outstanding segment list.
    pub fn release(&mut self) {
        self.space.clear();
        self.rtt.clear();
    }

    pub fn summary(&self, duration_secs: f64) -> DirectionSummary {
        let rtt = *self.rtt.rtt();
        DirectionSummary {
            packets: self.packets,
            data_packets: self.data_packets,
            data_bytes: self.data_bytes,
            unique_bytes: self.unique_bytes,
            rexmit_packets: self.rexmit_packets,
            rexmit_bytes: self.rexmit_bytes,
            out_of_order: self.out_of_order,
            pure_acks: self.pure_acks,
            truncated: self.truncated,
            syn_count: self.syn_count,
            fin_count: self.fin_count,
            rst_count: self.rst_count,
            mss: self.mss,
            window_scale: self.window_scale,
            sack_permitted: self.sack_permitted,
            sack_blocks: self.sack_blocks,
            timestamps_seen: self.timestamps_seen,
            win_min: self.win_min,
            win_max: self.win_max,
            zero_windows: self.zero_windows,
            rtt,
            rtt_avg_us: rtt.avg_us(),
            rtt_stdev_us: rtt.stdev_us(),
            rtt_last: *self.rtt.rtt_last(),
            rtt_3whs_us: self
                .rtt
                .rtt_3whs()
                .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX)),
            acks: *self.rtt.counters(),
            first_rexmit: self.first_rexmit,
            last_rexmit: self.last_rexmit,
            throughput_bps: self.throughput(duration_secs),
            space: self.space.summary(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionSummary {
    pub packets: u64,
    pub data_packets: u64,
    pub data_bytes: u64,
    pub unique_bytes: u64,
    pub rexmit_packets: u64,
    pub rexmit_bytes: u64,
    pub out_of_order: u64,
    pub pure_acks: u64,
    pub truncated: u64,
    pub syn_count: u32,
    pub fin_count: u32,
    pub rst_count: u32,
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub sack_blocks: u64,
    pub timestamps_seen: bool,
    pub win_min: Option<u32>,
    pub win_max: Option<u32>,
    pub zero_windows: u64,
    pub rtt: RttStats,
    pub rtt_avg_us: Option<f64>,
    pub rtt_stdev_us: Option<f64>,
    pub rtt_last: RttStats,
    pub rtt_3whs_us: Option<u64>,
    pub acks: AckCounters,
    pub first_rexmit: Option<Timestamp>,
    pub last_rexmit: Option<Timestamp>,
    pub throughput_bps: f64,
    pub space: SpaceSummary,
}

/// 一条双向 TCP 连接
#[derive(Debug)]
pub struct Flow {
    id: u64,
    key: FlowKey,
    pub first_time: Timestamp,
    pub last_time: Timestamp,
    pub packets: u64,
    pub a2b: DirectionState,
    pub b2a: DirectionState,
    /// 已关闭或被新连接取代
    pub inactive: bool,
    /// 因复用被新流取代
    pub superseded: bool,
}

impl Flow {
    pub fn new(id: u64, key: FlowKey, now: Timestamp) -> Self {
        Self {
            id,
            key,
            first_time: now,
            last_time: now,
            packets: 0,
            a2b: DirectionState::new(),
            b2a: DirectionState::new(),
            inactive: false,
            superseded: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn dir(&self, direction: Direction) -> &DirectionState {
        match direction {
            Direction::AtoB => &self.a2b,
            Direction::BtoA => &self.b2a,
        }
    }

    pub fn dir_mut(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::AtoB => &mut self.a2b,
            Direction::BtoA => &mut self.b2a,
        }
    }

    /// The sending direction and its twin, both mutable.
    pub fn pair_mut(&mut self, direction: Direction) -> (&mut DirectionState, &mut DirectionState) {
        match direction {
            Direction::AtoB => (&mut self.a2b, &mut self.b2a),
            Direction::BtoA => (&mut self.b2a, &mut self.a2b),
        }
    }

    pub fn reset_seen(&self) -> bool {
        self.a2b.rst_count > 0 || self.b2a.rst_count > 0
    }

    pub fn fin_or_reset_seen(&self) -> bool {
        self.reset_seen() || self.a2b.fin_count > 0 || self.b2a.fin_count > 0
    }

    /// 双向均见 FIN 或任一方 RST
    pub fn is_complete(&self) -> bool {
        self.reset_seen() || (self.a2b.fin_count > 0 && self.b2a.fin_count > 0)
    }

    pub fn duration_secs(&self) -> f64 {
        self.last_time.saturating_since(self.first_time).as_secs_f64()
    }

    pub fn release(&mut self) {
        self.a2b.release();
        self.b2a.release();
    }

    pub fn summary(&self) -> FlowSummary {
        let duration = self.duration_secs();
        FlowSummary {
            id: self.id,
            a: self.key.a().to_string(),
            b: self.key.b().to_string(),
            first_time: self.first_time,
            last_time: self.last_time,
            duration_secs: duration,
            packets: self.packets,
            complete: self.is_complete(),
            reset: self.reset_seen(),
            inactive: self.inactive,
            superseded: self.superseded,
            a2b: self.a2b.summary(duration),
            b2a: self.b2a.summary(duration),
        }
    }
}

/// Per-flow statistics handed to reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSummary {
    pub id: u64,
    pub a: String,
    pub b: String,
    pub first_time: Timestamp,
    pub last_time: Timestamp,
    pub duration_secs: f64,
    pub packets: u64,
    pub complete: bool,
    pub reset: bool,
    pub inactive: bool,
    pub superseded: bool,
    pub a2b: DirectionSummary,
    pub b2a: DirectionSummary,
}

impl FlowSummary {
    pub fn total_rexmit_bytes(&self) -> u64 {
        self.a2b.rexmit_bytes + self.b2a.rexmit_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_key_is_orientation_insensitive() {
        let fwd = FlowKey::new(addr("10.0.0.1:1234"), addr("10.0.0.2:80"));
        let rev = FlowKey::new(addr("10.0.0.2:80"), addr("10.0.0.1:1234"));
        assert_eq!(fwd, rev);
        assert_eq!(fwd.hash_value(), rev.hash_value());
        assert_eq!(fwd.bucket(1021), rev.bucket(1021));
        assert_eq!(fwd.cmp(&rev), Ordering::Equal);
        let set: HashSet<FlowKey> = [fwd, rev].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_direction_of() {
        let key = FlowKey::new(addr("10.0.0.1:1234"), addr("10.0.0.2:80"));
        assert_eq!(
            key.direction_of(addr("10.0.0.1:1234"), addr("10.0.0.2:80")),
            Some(Direction::AtoB)
        );
        assert_eq!(
            key.direction_of(addr("10.0.0.2:80"), addr("10.0.0.1:1234")),
            Some(Direction::BtoA)
        );
        assert_eq!(key.direction_of(addr("10.0.0.2:80"), addr("10.0.0.1:1235")), None);
        assert_eq!(Direction::AtoB.reverse(), Direction::BtoA);
    }

    #[test]
    fn test_different_ports_differ() {
        let k1 = FlowKey::new(addr("10.0.0.1:1234"), addr("10.0.0.2:80"));
        let k2 = FlowKey::new(addr("10.0.0.1:1235"), addr("10.0.0.2:80"));
        assert_ne!(k1, k2);
        assert_ne!(k1.cmp(&k2), Ordering::Equal);
    }

    #[test]
    fn test_ipv6_key() {
        let k1 = FlowKey::new(addr("[2001:db8::1]:443"), addr("[2001:db8::2]:50000"));
        let k2 = FlowKey::new(addr("[2001:db8::2]:50000"), addr("[2001:db8::1]:443"));
        assert_eq!(k1, k2);
        assert_eq!(k1.to_string(), "[2001:db8::1]:443 <-> [2001:db8::2]:50000");
    }

    #[test]
    fn test_window_and_seq_tracking() {
        let mut d = DirectionState::new();
        d.note_window(1000);
        d.note_window(0);
        d.note_window(5000);
        assert_eq!((d.win_min, d.win_max, d.win_last), (Some(0), Some(5000), Some(5000)));
        assert_eq!(d.zero_windows, 1);

        d.advance_max_seq(u32::MAX - 10);
        d.advance_max_seq(5);
        assert_eq!(d.max_seq, Some(5));
        d.advance_max_seq(u32::MAX);
        assert_eq!(d.max_seq, Some(5));
    }

    #[test]
    fn test_completion() {
        let key = FlowKey::new(addr("10.0.0.1:1"), addr("10.0.0.2:2"));
        let mut flow = Flow::new(1, key, Timestamp::from_micros(0));
        assert!(!flow.is_complete());
        flow.a2b.fin_count = 1;
        assert!(!flow.is_complete());
        assert!(flow.fin_or_reset_seen());
        flow.b2a.fin_count = 1;
        assert!(flow.is_complete());

        let mut flow = Flow::new(2, key, Timestamp::from_micros(0));
        flow.b2a.rst_count = 1;
        assert!(flow.is_complete());
        assert!(flow.reset_seen());
    }

    #[test]
    fn test_summary_serializes() {
        let key = FlowKey::new(addr("10.0.0.1:1"), addr("10.0.0.2:2"));
        let mut flow = Flow::new(7, key, Timestamp::from_secs_micros(1, 0));
        flow.last_time = Timestamp::from_secs_micros(3, 0);
        flow.a2b.unique_bytes = 1000;
        let summary = flow.summary();
        assert_eq!(summary.duration_secs, 2.0);
        assert_eq!(summary.a2b.throughput_bps, 500.0);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["a"], "10.0.0.1:1");
        assert_eq!(json["a2b"]["unique_bytes"], 1000);
    }
}
