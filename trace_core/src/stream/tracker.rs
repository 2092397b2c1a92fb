use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, trace, warn};
use serde::Serialize;

use super::flow::{Direction, Flow, FlowKey, FlowSummary};
use super::rtt::AckClass;
use super::seqspace::{seq_gt, seq_lt};
use crate::avl::AvlTree;
use crate::config::{CapacityPolicy, TrackerConfig, TrackerMode};
use crate::decode::{PacketRecord, Timestamp};
use crate::error::{Result, TrackerError};
use crate::memory::{FlowHandle, FlowPool, FlowPoolConfig};

#[derive(Debug, Clone, Copy)]
struct BucketEntry {
    key: FlowKey,
    handle: FlowHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residence {
    Live,
    /// `indexed` 为 false 表示已被同一四元组的新流取代, 只等待回收
    Closed { indexed: bool },
}

#[derive(Debug)]
struct TrackedFlow {
    flow: Flow,
    tick: u64,
    residence: Residence,
    closed_at: Option<Timestamp>,
}

/// Result of matching a packet to its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub handle: FlowHandle,
    pub direction: Direction,
    pub is_new: bool,
}

/// What the tracker concluded about one packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketEvent {
    pub handle: FlowHandle,
    pub flow_id: u64,
    pub direction: Direction,
    pub is_new: bool,
    /// 本报文中已发送过的字节数
    pub rexmit_bytes: u32,
    pub out_of_order: bool,
    pub ack_class: Option<AckClass>,
    /// 连续重复 ACK 的次数
    pub dup_repeats: u32,
    pub truncated: bool,
}

impl PacketEvent {
    pub fn is_rexmit(&self) -> bool {
        self.rexmit_bytes > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub packets: u64,
    pub malformed: u64,
    pub flows_created: u64,
    pub flows_closed: u64,
    pub flows_evicted: u64,
    pub capacity_evictions: u64,
    pub reuses_detected: u64,
    /// 哈希链上比较过的表项总数
    pub bucket_steps: u64,
    pub sweeps: u64,
}

/// 连接跟踪表
///
/// Flows live in a generational pool. Each hash bucket keeps its entries
/// most recently used first, and an optional AVL index mirrors the buckets
/// for ordered lookups. Live flows are also ordered by last touch so the
/// least recently used one can be evicted under capacity pressure; closed
/// flows queue up in closing order.
#[derive(Debug)]
pub struct ConnectionTracker {
    config: TrackerConfig,
    buckets: Vec<VecDeque<BucketEntry>>,
    snapshots: Option<AvlTree<FlowKey, FlowHandle>>,
    flows: FlowPool<TrackedFlow>,
    recency: BTreeMap<u64, FlowHandle>,
    closed: VecDeque<FlowHandle>,
    evicted: Vec<FlowSummary>,
    stats: TrackerStats,
    tick: u64,
    next_id: u64,
    next_sweep: Option<Timestamp>,
    capacity_warned: bool,
}

impl ConnectionTracker {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let snapshots = config.uses_snapshot_index().then(AvlTree::new);
        let pool_config = FlowPoolConfig {
            initial_slots: config.max_flows.unwrap_or(1024).min(1 << 16),
            ..Default::default()
        };
        Ok(Self {
            buckets: (0..config.hash_buckets).map(|_| VecDeque::new()).collect(),
            snapshots,
            flows: FlowPool::new(pool_config),
            recency: BTreeMap::new(),
            closed: VecDeque::new(),
            evicted: Vec::new(),
            stats: TrackerStats::default(),
            tick: 0,
            next_id: 1,
            next_sweep: None,
            capacity_warned: false,
            config,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    /// Runs one packet through lookup, sequence and ACK tracking.
    pub fn process(&mut self, record: &PacketRecord) -> Result<PacketEvent> {
        if let Err(err) = record.validate() {
            self.stats.malformed += 1;
            warn!("dropping packet at {}: {}", record.timestamp, err);
            return Err(err);
        }
        self.stats.packets += 1;
        if self.config.mode == TrackerMode::Continuous {
            self.maybe_sweep(record.timestamp);
        }

        let lookup = self.find_or_create(record)?;
        let tracked = self.flows.get_mut(lookup.handle).ok_or_else(|| {
            TrackerError::InternalInconsistency(format!("flow {:?} missing after lookup", lookup.handle))
        })?;
        let event = update_flow(&mut tracked.flow, lookup, record, &self.config);
        let closing = tracked.residence == Residence::Live && tracked.flow.is_complete();

        trace!(
            "{} {} #{} {} seq={} ack={} len={} rexmit={} ooo={} ack_class={:?}",
            record.timestamp,
            lookup.direction,
            event.flow_id,
            record.flags,
            record.seq,
            record.ack,
            record.payload_len,
            event.rexmit_bytes,
            event.out_of_order,
            event.ack_class
        );

        if closing {
            self.close(lookup.handle, record.timestamp);
        }
        Ok(event)
    }

    /// Finds the flow a packet belongs to, creating one when nothing matches
    /// or when the match looks like an earlier connection on the same tuple.
    pub fn find_or_create(&mut self, record: &PacketRecord) -> Result<Lookup> {
        let key = FlowKey::new(record.src, record.dst);
        if let Some((handle, direction)) = self.find(&key, record.src, record.dst) {
            match self.staleness(handle, direction, record) {
                None => {
                    self.touch(handle);
                    return Ok(Lookup {
                        handle,
                        direction,
                        is_new: false,
                    });
                }
                Some(reason) => {
                    warn!("{} reused ({}), starting a new flow", key, reason);
                    self.stats.reuses_detected += 1;
                    self.retire(handle, record.timestamp);
                }
            }
        }
        let handle = self.create(key, record.timestamp)?;
        Ok(Lookup {
            handle,
            direction: Direction::AtoB,
            is_new: true,
        })
    }

    /// 在哈希链中查找, 命中后移到链首
    fn find(&mut self, key: &FlowKey, src: SocketAddr, dst: SocketAddr) -> Option<(FlowHandle, Direction)> {
        let bucket = key.bucket(self.buckets.len());
        let chain = self.buckets.get_mut(bucket)?;
        let pos = chain.iter().position(|e| e.key == *key);
        self.stats.bucket_steps += pos.map_or(chain.len(), |p| p + 1) as u64;
        let pos = pos?;
        if pos > 0 {
            if let Some(entry) = chain.remove(pos) {
                chain.push_front(entry);
            }
        }
        let entry = chain.front()?;
        let direction = entry.key.direction_of(src, dst)?;
        Some((entry.handle, direction))
    }

    /// Read-only lookup through the hash buckets.
    pub fn lookup(&self, src: SocketAddr, dst: SocketAddr) -> Option<FlowHandle> {
        let key = FlowKey::new(src, dst);
        self.buckets
            .get(key.bucket(self.buckets.len()))?
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.handle)
    }

    /// Lookup through the AVL index, when it is maintained.
    pub fn lookup_snapshot(&self, src: SocketAddr, dst: SocketAddr) -> Option<FlowHandle> {
        let key = FlowKey::new(src, dst);
        self.snapshots.as_ref()?.get(&key).copied()
    }

    /// Handles in the bucket `src`/`dst` hashes to, front first.
    pub fn bucket_chain(&self, src: SocketAddr, dst: SocketAddr) -> Vec<FlowHandle> {
        let key = FlowKey::new(src, dst);
        self.buckets
            .get(key.bucket(self.buckets.len()))
            .map(|chain| chain.iter().map(|e| e.handle).collect())
            .unwrap_or_default()
    }

    /// Why the matched flow should not take this packet, if it shouldn't.
    /// The batch rules are heuristics and will miss some reuses.
    fn staleness(&self, handle: FlowHandle, direction: Direction, record: &PacketRecord) -> Option<&'static str> {
        let tracked = self.flows.get(handle)?;
        let flow = &tracked.flow;
        let idle = record.timestamp.saturating_since(flow.last_time);
        let syn = record.flags.syn();

        match self.config.mode {
            TrackerMode::Continuous => {
                if syn && matches!(tracked.residence, Residence::Closed { .. }) {
                    return Some("syn on closed flow");
                }
                if idle > Duration::from_secs(self.config.live_idle_secs) {
                    return Some("idle timeout");
                }
                None
            }
            TrackerMode::Batch => {
                if !self.config.detect_reuse {
                    return None;
                }
                if idle > Duration::from_secs(self.config.reuse_idle_secs) {
                    return Some("idle timeout");
                }
                if !syn {
                    return None;
                }
                let this = flow.dir(direction);
                if flow.fin_or_reset_seen() {
                    let past_window = this.windowend.map_or(true, |end| seq_gt(record.seq, end));
                    let before_isn = this.syn.is_some_and(|isn| seq_lt(record.seq, isn));
                    if past_window || before_isn {
                        return Some("syn outside window after close");
                    }
                }
                if this.syn_count > 0 && this.syn.is_some_and(|isn| isn != record.seq) {
                    return Some("syn with a new isn");
                }
                None
            }
        }
    }

    fn create(&mut self, key: FlowKey, now: Timestamp) -> Result<FlowHandle> {
        self.make_room()?;
        let id = self.next_id;
        self.next_id += 1;
        let handle = self.flows.acquire(TrackedFlow {
            flow: Flow::new(id, key, now),
            tick: 0,
            residence: Residence::Live,
            closed_at: None,
        });
        if let Some(tree) = self.snapshots.as_mut() {
            if tree.insert(key, handle).is_err() {
                self.flows.release(handle);
                return Err(TrackerError::InternalInconsistency(format!(
                    "{} already present in snapshot index",
                    key
                )));
            }
        }
        let bucket = key.bucket(self.buckets.len());
        if let Some(chain) = self.buckets.get_mut(bucket) {
            chain.push_front(BucketEntry { key, handle });
        }
        self.touch(handle);
        self.stats.flows_created += 1;
        debug!("new flow #{} {}", id, key);
        Ok(handle)
    }

    /// Frees a slot when the table is at `max_flows`.
    fn make_room(&mut self) -> Result<()> {
        let Some(limit) = self.config.max_flows else {
            return Ok(());
        };
        while self.flows.len() >= limit {
            if self.config.capacity_policy == CapacityPolicy::Fail {
                warn!("flow table full ({} flows), rejecting new flow", limit);
                return Err(TrackerError::CapacityExceeded { limit });
            }
            // 先回收已关闭的流, 再回收最久未使用的活跃流
            let victim = self
                .closed
                .front()
                .copied()
                .or_else(|| self.recency.values().next().copied());
            let Some(victim) = victim else {
                return Err(TrackerError::InternalInconsistency(format!(
                    "{} resident flows but none evictable",
                    self.flows.len()
                )));
            };
            if !self.capacity_warned {
                warn!("flow table full ({} flows), evicting oldest flows", limit);
                self.capacity_warned = true;
            }
            self.stats.capacity_evictions += 1;
            if !self.evict(victim) {
                return Err(TrackerError::InternalInconsistency(format!(
                    "eviction candidate {:?} is stale",
                    victim
                )));
            }
        }
        Ok(())
    }

    fn touch(&mut self, handle: FlowHandle) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(tracked) = self.flows.get_mut(handle) {
            if tracked.residence == Residence::Live {
                self.recency.remove(&tracked.tick);
                self.recency.insert(tick, handle);
            }
            tracked.tick = tick;
        }
    }

    fn unindex(&mut self, key: &FlowKey, handle: FlowHandle) {
        let bucket = key.bucket(self.buckets.len());
        if let Some(chain) = self.buckets.get_mut(bucket) {
            if let Some(pos) = chain.iter().position(|e| e.handle == handle) {
                chain.remove(pos);
            }
        }
        if let Some(tree) = self.snapshots.as_mut() {
            if tree.get(key) == Some(&handle) {
                tree.remove(key);
            }
        }
    }

    /// 被新连接取代: 移出索引, 但保留记录直到回收
    fn retire(&mut self, handle: FlowHandle, now: Timestamp) {
        let Some(tracked) = self.flows.get_mut(handle) else {
            return;
        };
        let key = *tracked.flow.key();
        let was_live = tracked.residence == Residence::Live;
        let tick = tracked.tick;
        tracked.flow.inactive = true;
        tracked.flow.superseded = true;
        tracked.residence = Residence::Closed { indexed: false };
        tracked.closed_at.get_or_insert(now);
        self.unindex(&key, handle);
        if was_live {
            self.recency.remove(&tick);
            self.closed.push_back(handle);
        }
    }

    /// Marks a flow inactive and moves it to the closed list. It stays in
    /// the index so trailing packets still find it.
    pub fn mark_closed(&mut self, handle: FlowHandle) -> bool {
        let Some(at) = self.flows.get(handle).map(|t| t.flow.last_time) else {
            return false;
        };
        self.close(handle, at)
    }

    fn close(&mut self, handle: FlowHandle, at: Timestamp) -> bool {
        let Some(tracked) = self.flows.get_mut(handle) else {
            return false;
        };
        if tracked.residence != Residence::Live {
            return false;
        }
        tracked.residence = Residence::Closed { indexed: true };
        tracked.flow.inactive = true;
        tracked.closed_at = Some(at);
        let tick = tracked.tick;
        debug!(
            "flow #{} {} closed{}",
            tracked.flow.id(),
            tracked.flow.key(),
            if tracked.flow.reset_seen() { " by reset" } else { "" }
        );
        self.recency.remove(&tick);
        self.closed.push_back(handle);
        self.stats.flows_closed += 1;
        if self.config.mode == TrackerMode::Continuous {
            self.trim_closed();
        }
        true
    }

    fn trim_closed(&mut self) {
        while self.closed.len() > self.config.max_closed {
            let Some(handle) = self.closed.front().copied() else {
                break;
            };
            if !self.evict(handle) {
                self.closed.pop_front();
            }
        }
    }

    /// Removes a flow from every index and frees its sequence space and
    /// outstanding segments. Its summary is kept for `take_evicted`.
    /// Returns false for a handle that is no longer resident.
    pub fn evict(&mut self, handle: FlowHandle) -> bool {
        let Some(tracked) = self.flows.get(handle) else {
            return false;
        };
        let key = *tracked.flow.key();
        let residence = tracked.residence;
        let tick = tracked.tick;
        match residence {
            Residence::Live => {
                self.recency.remove(&tick);
                self.unindex(&key, handle);
            }
            Residence::Closed { indexed } => {
                if indexed {
                    self.unindex(&key, handle);
                }
                if let Some(pos) = self.closed.iter().position(|h| *h == handle) {
                    self.closed.remove(pos);
                }
            }
        }
        let Some(mut tracked) = self.flows.release(handle) else {
            return false;
        };
        tracked.flow.inactive = true;
        self.evicted.push(tracked.flow.summary());
        tracked.flow.release();
        self.stats.flows_evicted += 1;
        debug!("evicted flow #{} {}", tracked.flow.id(), key);
        true
    }

    fn maybe_sweep(&mut self, now: Timestamp) {
        match self.next_sweep {
            Some(at) if now < at => {}
            Some(_) => {
                self.sweep(now);
                self.next_sweep = now.checked_add(Duration::from_secs(self.config.sweep_interval_secs));
            }
            None => {
                self.next_sweep = now.checked_add(Duration::from_secs(self.config.sweep_interval_secs));
            }
        }
    }

    /// Closes live flows idle past `live_idle_secs` and evicts closed flows
    /// older than `closed_linger_secs` or beyond `max_closed`. Returns the
    /// number of flows evicted.
    pub fn sweep(&mut self, now: Timestamp) -> usize {
        self.stats.sweeps += 1;
        let before = self.stats.flows_evicted;

        let idle = Duration::from_secs(self.config.live_idle_secs);
        let stale: Vec<FlowHandle> = self
            .recency
            .values()
            .copied()
            .filter(|h| {
                self.flows
                    .get(*h)
                    .is_some_and(|t| now.saturating_since(t.flow.last_time) > idle)
            })
            .collect();
        for handle in stale {
            self.close(handle, now);
        }

        let linger = Duration::from_secs(self.config.closed_linger_secs);
        while let Some(handle) = self.closed.front().copied() {
            let expired = self
                .flows
                .get(handle)
                .and_then(|t| t.closed_at)
                .map_or(true, |at| now.saturating_since(at) >= linger);
            if !expired {
                break;
            }
            if !self.evict(handle) {
                self.closed.pop_front();
            }
        }
        self.trim_closed();

        let evicted = (self.stats.flows_evicted - before) as usize;
        if evicted > 0 {
            info!(
                "sweep at {}: evicted {} flows, {} resident",
                now,
                evicted,
                self.flows.len()
            );
        }
        evicted
    }

    pub fn flow(&self, handle: FlowHandle) -> Option<&Flow> {
        self.flows.get(handle).map(|t| &t.flow)
    }

    /// Every resident flow, including closed and superseded ones.
    pub fn flows(&self) -> impl Iterator<Item = (FlowHandle, &Flow)> {
        self.flows.iter().map(|(h, t)| (h, &t.flow))
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.recency.len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }

    pub fn is_closed(&self, handle: FlowHandle) -> bool {
        self.flows
            .get(handle)
            .is_some_and(|t| matches!(t.residence, Residence::Closed { .. }))
    }

    /// Summaries of flows evicted since the last call.
    pub fn take_evicted(&mut self) -> Vec<FlowSummary> {
        std::mem::take(&mut self.evicted)
    }

    /// Summaries of resident flows, in creation order.
    pub fn summaries(&self) -> Vec<FlowSummary> {
        let mut out: Vec<FlowSummary> = self.flows.iter().map(|(_, t)| t.flow.summary()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Consumes the tracker, returning evicted and resident summaries in
    /// creation order.
    pub fn finish(mut self) -> Vec<FlowSummary> {
        let mut out = self.take_evicted();
        out.extend(self.summaries());
        out.sort_by_key(|s| s.id);
        info!(
            "{} packets, {} flows ({} closed, {} evicted, {} reused tuples)",
            self.stats.packets,
            self.stats.flows_created,
            self.stats.flows_closed,
            self.stats.flows_evicted,
            self.stats.reuses_detected
        );
        out
    }

    /// Cross-checks the hash buckets, the snapshot index and the pool.
    pub fn verify_indexes(&self) -> Result<()> {
        let indexed: usize = self.buckets.iter().map(|c| c.len()).sum();
        for (bucket, chain) in self.buckets.iter().enumerate() {
            for entry in chain {
                if entry.key.bucket(self.buckets.len()) != bucket {
                    return Err(TrackerError::InternalInconsistency(format!(
                        "{} chained in bucket {}",
                        entry.key, bucket
                    )));
                }
                if !self.flows.contains(entry.handle) {
                    return Err(TrackerError::InternalInconsistency(format!(
                        "bucket {} holds stale handle {:?}",
                        bucket, entry.handle
                    )));
                }
                if let Some(tree) = &self.snapshots {
                    if tree.get(&entry.key) != Some(&entry.handle) {
                        return Err(TrackerError::InternalInconsistency(format!(
                            "{} missing from snapshot index",
                            entry.key
                        )));
                    }
                }
            }
        }
        if let Some(tree) = &self.snapshots {
            tree.check_invariants()
                .map_err(TrackerError::InternalInconsistency)?;
            if tree.len() != indexed {
                return Err(TrackerError::InternalInconsistency(format!(
                    "snapshot index holds {} flows, buckets {}",
                    tree.len(),
                    indexed
                )));
            }
        }
        Ok(())
    }
}

/// Applies one packet to its flow.
fn update_flow(flow: &mut Flow, lookup: Lookup, record: &PacketRecord, config: &TrackerConfig) -> PacketEvent {
    let now = record.timestamp;
    let flags = record.flags;
    let len = record.payload_len;

    flow.packets += 1;
    if now > flow.last_time {
        flow.last_time = now;
    }
    let flow_id = flow.id();
    let (this, other) = flow.pair_mut(lookup.direction);

    this.packets += 1;
    this.first_time.get_or_insert(now);
    this.last_time = Some(now);
    this.latest_seq = Some(record.seq);

    if flags.syn() {
        this.syn_count += 1;
        if this.syn.is_none() {
            this.syn = Some(record.seq);
        }
        if config.track_rtt {
            this.rtt.record_syn(record.seq, now);
        }
        this.advance_max_seq(record.seq.wrapping_add(1));
    }
    if flags.rst() {
        this.rst_count += 1;
    }
    this.note_options(&record.options, flags.syn());

    // 窗口缩放只有在双方 SYN 都带该选项时才生效, 且不作用于 SYN 本身
    let shift = match (this.window_scale, other.window_scale) {
        (Some(ours), Some(_)) if !flags.syn() => ours,
        _ => 0,
    };
    let window = u32::from(record.window) << shift;
    this.note_window(window);
    if flags.ack() {
        other.windowend = Some(record.ack.wrapping_add(window));
    }

    let data_seq = if flags.syn() {
        record.seq.wrapping_add(1)
    } else {
        record.seq
    };
    let mut rexmit_bytes = 0;
    let mut out_of_order = false;
    if len > 0 {
        this.data_packets += 1;
        this.data_bytes += u64::from(len);
        if record.is_truncated() {
            this.truncated += 1;
        }
        if config.track_rexmit {
            let class = this.space.classify(data_seq, len);
            rexmit_bytes = class.rexmit_bytes;
            out_of_order = class.out_of_order;
        }
        if rexmit_bytes > 0 {
            this.rexmit_packets += 1;
            this.rexmit_bytes += u64::from(rexmit_bytes);
            this.note_rexmit(now);
        }
        if out_of_order {
            this.out_of_order += 1;
        }
        this.unique_bytes += u64::from(len - rexmit_bytes.min(len));
        this.advance_max_seq(data_seq.wrapping_add(len));
        if config.track_rtt {
            this.rtt.record_send(data_seq, len, now);
        }
    }
    if flags.fin() {
        this.fin_count += 1;
        let fin = data_seq.wrapping_add(len);
        this.fin = Some(fin);
        this.advance_max_seq(fin.wrapping_add(1));
    }

    let pure_ack = flags.ack() && len == 0 && !flags.syn() && !flags.fin() && !flags.rst();
    if pure_ack {
        this.pure_acks += 1;
    }
    let mut ack_class = None;
    let mut dup_repeats = 0;
    if flags.ack() {
        if config.track_rtt {
            ack_class = Some(other.rtt.ack_in(record.ack, now, this.ack, pure_ack));
            dup_repeats = other.rtt.dup_repeats();
        }
        this.ack = Some(record.ack);
    }

    PacketEvent {
        handle: lookup.handle,
        flow_id,
        direction: lookup.direction,
        is_new: lookup.is_new,
        rexmit_bytes,
        out_of_order,
        ack_class,
        dup_repeats,
        truncated: record.is_truncated(),
    }
}
