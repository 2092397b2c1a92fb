use std::cmp::Ordering;

use log::{debug, trace};
use serde::Serialize;

/// Each quadrant covers 2^30 sequence numbers, selected by the top two bits.
pub const QUAD_SIZE: u64 = 1 << 30;
const QUAD_COUNT: usize = 4;

/// Modular comparison: `a - b` read as a signed 32-bit distance.
pub fn seq_cmp(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}

pub fn seq_lt(a: u32, b: u32) -> bool {
    seq_cmp(a, b) == Ordering::Less
}

pub fn seq_leq(a: u32, b: u32) -> bool {
    seq_cmp(a, b) != Ordering::Greater
}

pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_cmp(a, b) == Ordering::Greater
}

pub fn seq_geq(a: u32, b: u32) -> bool {
    seq_cmp(a, b) != Ordering::Less
}

fn quad_index(seq: u32) -> usize {
    (seq >> 30) as usize
}

fn quad_last(ix: usize) -> u32 {
    ((ix as u32) << 30) | (QUAD_SIZE as u32 - 1)
}

/// A run of sequence numbers sent at least once, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SentInterval {
    pub begin: u32,
    pub end: u32,
    pub retrans: u32,
}

impl SentInterval {
    fn new(begin: u32, end: u32) -> Self {
        Self { begin, end, retrans: 0 }
    }

    /// Number of sequence numbers covered.
    pub fn span(&self) -> u64 {
        self.end as u64 - self.begin as u64 + 1
    }

    fn touches(&self, next: &SentInterval) -> bool {
        self.end as u64 + 1 >= next.begin as u64
    }
}

/// Sorted, non-overlapping, non-adjacent intervals inside one quadrant.
/// Every value in a quadrant shares its top two bits, so plain integer
/// comparison is safe here.
#[derive(Debug, Default, Clone)]
pub struct Quadrant {
    intervals: Vec<SentInterval>,
    full: bool,
}

impl Quadrant {
    pub fn intervals(&self) -> &[SentInterval] {
        &self.intervals
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Records `[first, last]` and returns how many of those bytes were
    /// already recorded.
    fn add(&mut self, mut first: u32, last: u32, out_of_order: &mut bool) -> u32 {
        let mut rexmit = 0u32;

        // 常见情况: 追加在末尾
        match self.intervals.last().map(|tail| tail.end) {
            None => {
                self.intervals.push(SentInterval::new(first, last));
                self.collapse();
                return 0;
            }
            Some(end) if first > end => {
                if end as u64 + 1 == first as u64 {
                    if let Some(tail) = self.intervals.last_mut() {
                        tail.end = last;
                    }
                } else {
                    self.intervals.push(SentInterval::new(first, last));
                }
                self.collapse();
                return 0;
            }
            Some(_) => {}
        }

        let mut ix = 0;
        while ix < self.intervals.len() {
            let current = self.intervals[ix];
            if first > current.end {
                ix += 1;
                continue;
            }

            if first < current.begin {
                // finishing inside an interval that was sent earlier means
                // this data went out late
                if last <= current.end {
                    *out_of_order = true;
                }
                if last < current.begin {
                    self.intervals.insert(ix, SentInterval::new(first, last));
                    self.collapse();
                    return rexmit;
                }
                self.intervals
                    .insert(ix, SentInterval::new(first, current.begin - 1));
                ix += 1;
                first = current.begin;
            }

            // first lies inside `current`
            self.intervals[ix].retrans += 1;
            if last <= current.end {
                rexmit += last - first + 1;
                self.collapse();
                return rexmit;
            }
            rexmit += current.end - first + 1;
            first = current.end + 1;
            ix += 1;
        }

        self.intervals.push(SentInterval::new(first, last));
        self.collapse();
        rexmit
    }

    fn collapse(&mut self) {
        if self.intervals.is_empty() {
            self.full = false;
            return;
        }
        let mut write = 0;
        for read in 1..self.intervals.len() {
            let next = self.intervals[read];
            let prev = &mut self.intervals[write];
            if prev.touches(&next) {
                prev.end = prev.end.max(next.end);
                prev.retrans = prev.retrans.max(next.retrans);
            } else {
                write += 1;
                self.intervals[write] = next;
            }
        }
        self.intervals.truncate(write + 1);
        self.full = self.intervals.len() == 1 && self.intervals[0].span() == QUAD_SIZE;
    }
}

/// Outcome of classifying one data segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SegmentClass {
    pub rexmit_bytes: u32,
    pub out_of_order: bool,
}

impl SegmentClass {
    pub fn is_rexmit(&self) -> bool {
        self.rexmit_bytes > 0
    }
}

/// Coverage summary for reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpaceSummary {
    pub begin: Option<u32>,
    pub end: Option<u32>,
    pub intervals: usize,
    pub quadrants_populated: usize,
    pub full_quadrants: usize,
    pub wrap_count: u32,
    /// 因象限轮转而丢弃的区间数
    pub released_intervals: u64,
}

/// Which byte ranges one direction of a connection has sent.
///
/// The 32-bit space is split into four quadrants, allocated as data shows up
/// in them. The quadrant currently receiving data keeps both neighbours
/// allocated; moving forward into the next quadrant releases the one
/// opposite it, so at most three are ever resident.
#[derive(Debug, Default)]
pub struct SequenceSpace {
    quads: [Option<Quadrant>; QUAD_COUNT],
    centre: Option<usize>,
    origin: Option<usize>,
    visited: [bool; QUAD_COUNT],
    bounds: Option<(u32, u32)>,
    wrap_count: u32,
    released_intervals: u64,
}

impl SequenceSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `len` bytes starting at `seq`. Segments must be fed in
    /// capture order for the out-of-order flag to mean anything.
    pub fn classify(&mut self, seq: u32, len: u32) -> SegmentClass {
        if len == 0 {
            return SegmentClass::default();
        }
        let last = seq.wrapping_add(len - 1);
        let mut class = SegmentClass::default();

        match self.bounds {
            None => self.bounds = Some((seq, last)),
            Some((begin, end)) => {
                let begin = if seq_lt(seq, begin) { seq } else { begin };
                let end = if seq_gt(last, end) { last } else { end };
                self.bounds = Some((begin, end));
            }
        }

        let mut first = seq;
        let mut remaining = len as u64;
        loop {
            let ix = quad_index(first);
            let room = (quad_last(ix) - first) as u64 + 1;
            let chunk = room.min(remaining);
            let chunk_last = first.wrapping_add((chunk - 1) as u32);
            let quad = self.which_quad(ix);
            class.rexmit_bytes += quad.add(first, chunk_last, &mut class.out_of_order);
            remaining -= chunk;
            if remaining == 0 {
                break;
            }
            trace!("segment {}+{} crosses into quadrant {}", seq, len, (ix + 1) % QUAD_COUNT);
            first = chunk_last.wrapping_add(1);
        }

        trace!(
            "classify seq={} len={}: rexmit={} out_of_order={}",
            seq,
            len,
            class.rexmit_bytes,
            class.out_of_order
        );
        class
    }

    fn which_quad(&mut self, ix: usize) -> &mut Quadrant {
        let next = (ix + 1) % QUAD_COUNT;
        let prev = (ix + 3) % QUAD_COUNT;
        let opposite = (ix + 2) % QUAD_COUNT;

        match self.centre {
            Some(centre) if centre == ix => {}
            // stepping back into the trailing quadrant keeps the layout
            Some(centre) if (centre + 3) % QUAD_COUNT == ix => {}
            centre => {
                let forward = centre.map_or(false, |c| (c + 1) % QUAD_COUNT == ix);
                if let Some(released) = self.quads[opposite].take() {
                    if released.intervals.is_empty() {
                        trace!("released empty quadrant {} entering quadrant {}", opposite, ix);
                    } else {
                        // 之后重发这部分数据会被当作新数据
                        debug!(
                            "released quadrant {} with {} intervals entering quadrant {}, coverage lost",
                            opposite,
                            released.intervals.len(),
                            ix
                        );
                        self.released_intervals += released.intervals.len() as u64;
                    }
                }
                self.quads[next].get_or_insert_with(Quadrant::default);
                self.quads[prev].get_or_insert_with(Quadrant::default);
                self.centre = Some(ix);
                if self.origin.is_none() {
                    self.origin = Some(ix);
                }
                if forward && self.origin == Some(ix) && self.visited.iter().all(|v| *v) {
                    self.wrap_count += 1;
                    self.visited = [false; QUAD_COUNT];
                    debug!("sequence space wrapped ({} times)", self.wrap_count);
                }
                self.visited[ix] = true;
            }
        }
        self.quads[ix].get_or_insert_with(Quadrant::default)
    }

    pub fn quadrant(&self, ix: usize) -> Option<&Quadrant> {
        self.quads.get(ix).and_then(|q| q.as_ref())
    }

    /// Intervals of the quadrant that holds `seq`.
    pub fn intervals_at(&self, seq: u32) -> &[SentInterval] {
        self.quadrant(quad_index(seq))
            .map(|q| q.intervals())
            .unwrap_or(&[])
    }

    pub fn wrap_count(&self) -> u32 {
        self.wrap_count
    }

    /// Intervals dropped with a released quadrant.
    pub fn released_intervals(&self) -> u64 {
        self.released_intervals
    }

    pub fn bounds(&self) -> Option<(u32, u32)> {
        self.bounds
    }

    pub fn summary(&self) -> SpaceSummary {
        let populated = self.quads.iter().flatten();
        SpaceSummary {
            begin: self.bounds.map(|(b, _)| b),
            end: self.bounds.map(|(_, e)| e),
            intervals: populated.clone().map(|q| q.intervals.len()).sum(),
            quadrants_populated: populated.clone().filter(|q| !q.intervals.is_empty()).count(),
            full_quadrants: populated.filter(|q| q.full).count(),
            wrap_count: self.wrap_count,
            released_intervals: self.released_intervals,
        }
    }

    /// Drops every quadrant; used when the owning flow is evicted.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn spans(space: &SequenceSpace, seq: u32) -> Vec<(u32, u32)> {
        space.intervals_at(seq).iter().map(|i| (i.begin, i.end)).collect()
    }

    #[test]
    fn test_seq_compare_wraps() {
        assert!(seq_lt(0xffff_fff0, 0x10));
        assert!(seq_gt(0x10, 0xffff_fff0));
        assert!(seq_leq(5, 5) && seq_geq(5, 5));
        assert_eq!(seq_cmp(7, 7), Ordering::Equal);
    }

    #[test]
    fn test_first_segment() {
        let mut space = SequenceSpace::new();
        assert_eq!(space.classify(1000, 500), SegmentClass::default());
        assert_eq!(spans(&space, 1000), vec![(1000, 1499)]);
        assert_eq!(space.bounds(), Some((1000, 1499)));
        assert_eq!(space.classify(1000, 0), SegmentClass::default());
    }

    #[test]
    fn test_exact_duplicate() {
        let mut space = SequenceSpace::new();
        space.classify(100, 100);
        let class = space.classify(100, 100);
        assert_eq!(class.rexmit_bytes, 100);
        assert!(!class.out_of_order);
        assert_eq!(spans(&space, 100), vec![(100, 199)]);
        assert_eq!(space.intervals_at(100)[0].retrans, 1);
    }

    #[test]
    fn test_partial_overlap() {
        let mut space = SequenceSpace::new();
        space.classify(100, 100);
        let class = space.classify(150, 100);
        assert_eq!(class, SegmentClass { rexmit_bytes: 50, out_of_order: false });
        assert_eq!(spans(&space, 100), vec![(100, 249)]);
    }

    #[test]
    fn test_contiguous_extension() {
        let mut space = SequenceSpace::new();
        space.classify(100, 100);
        assert_eq!(space.classify(200, 100), SegmentClass::default());
        assert_eq!(spans(&space, 100), vec![(100, 299)]);
    }

    #[test]
    fn test_gap_fill_is_out_of_order() {
        let mut space = SequenceSpace::new();
        space.classify(100, 100);
        assert_eq!(space.classify(300, 50), SegmentClass::default());
        assert_eq!(spans(&space, 100), vec![(100, 199), (300, 349)]);

        let class = space.classify(200, 100);
        assert!(class.out_of_order);
        assert_eq!(class.rexmit_bytes, 0);
        assert_eq!(spans(&space, 100), vec![(100, 349)]);
    }

    #[test]
    fn test_overlap_across_hole() {
        let mut space = SequenceSpace::new();
        space.classify(100, 100);
        space.classify(300, 100);
        // 150..=349: 50 old bytes, a 100 byte hole, 50 more old bytes
        let class = space.classify(150, 200);
        assert_eq!(class.rexmit_bytes, 100);
        assert!(class.out_of_order);
        assert_eq!(spans(&space, 100), vec![(100, 399)]);
    }

    #[test]
    fn test_hole_fill_ending_at_interval_end() {
        let mut short = SequenceSpace::new();
        short.classify(100, 100);
        short.classify(300, 50);
        let class = short.classify(200, 149);
        assert_eq!(class, SegmentClass { rexmit_bytes: 49, out_of_order: true });

        // 补洞并完整重发 [300,349]
        let mut space = SequenceSpace::new();
        space.classify(100, 100);
        space.classify(300, 50);
        let class = space.classify(200, 150);
        assert_eq!(class, SegmentClass { rexmit_bytes: 50, out_of_order: true });
        assert_eq!(spans(&space, 100), vec![(100, 349)]);
    }

    #[test]
    fn test_hole_fill_past_last_interval() {
        let mut space = SequenceSpace::new();
        space.classify(100, 100);
        space.classify(300, 50);
        // covers [300,349] and runs on into new data at the tail
        let class = space.classify(200, 200);
        assert_eq!(class, SegmentClass { rexmit_bytes: 50, out_of_order: false });
        assert_eq!(spans(&space, 100), vec![(100, 399)]);
        assert_eq!(space.intervals_at(100)[0].retrans, 1);
    }

    #[test]
    fn test_segment_before_everything() {
        let mut space = SequenceSpace::new();
        space.classify(300, 100);
        let class = space.classify(250, 80);
        assert_eq!(class.rexmit_bytes, 30);
        assert!(class.out_of_order);
        assert_eq!(spans(&space, 300), vec![(250, 399)]);
        assert_eq!(space.bounds(), Some((250, 399)));
    }

    #[test]
    fn test_cross_quadrant_segment() {
        let boundary = 0x4000_0000u32;
        let mut space = SequenceSpace::new();
        assert_eq!(space.classify(boundary - 100, 300), SegmentClass::default());
        assert_eq!(spans(&space, boundary - 1), vec![(boundary - 100, boundary - 1)]);
        assert_eq!(spans(&space, boundary), vec![(boundary, boundary + 199)]);

        // resend only the spill-over part plus new data
        let class = space.classify(boundary + 100, 200);
        assert_eq!(class.rexmit_bytes, 100);
        assert_eq!(spans(&space, boundary), vec![(boundary, boundary + 299)]);

        let class = space.classify(boundary - 50, 100);
        assert_eq!(class.rexmit_bytes, 100);
    }

    #[test]
    fn test_wraparound_at_zero() {
        let mut space = SequenceSpace::new();
        space.classify(0xffff_ff00, 0x200);
        assert_eq!(spans(&space, 0xffff_ffff), vec![(0xffff_ff00, 0xffff_ffff)]);
        assert_eq!(spans(&space, 0), vec![(0, 0xff)]);
        assert_eq!(space.bounds(), Some((0xffff_ff00, 0xff)));

        let class = space.classify(0xffff_fff0, 0x20);
        assert_eq!(class.rexmit_bytes, 0x20);
        assert!(!class.out_of_order);
    }

    #[test]
    fn test_rotation_releases_opposite_quadrant() {
        let mut space = SequenceSpace::new();
        space.classify(10, 10);
        assert!(space.quadrant(0).is_some());
        assert!(space.quadrant(1).is_some());
        assert!(space.quadrant(3).is_some());
        assert!(space.quadrant(2).is_none());

        space.classify(0x4000_0010, 10);
        space.classify(0x8000_0010, 10);
        // entering quadrant 2 drops quadrant 0
        assert!(space.intervals_at(10).is_empty());
        assert_eq!(space.released_intervals(), 1);
        assert_eq!(space.summary().released_intervals, 1);
        assert_eq!(space.classify(10, 10), SegmentClass::default());
    }

    #[test]
    fn test_jump_to_opposite_quadrant_loses_coverage() {
        let mut space = SequenceSpace::new();
        space.classify(100, 100);
        space.classify(300, 100);
        // 直接跳到对面象限, 象限 0 的两个区间被丢弃
        space.classify(0x8000_0000, 10);
        assert_eq!(space.released_intervals(), 2);
        assert!(space.quadrant(0).is_none());
        assert_eq!(space.classify(100, 100).rexmit_bytes, 0);
    }

    #[test]
    fn test_full_quadrant_and_wrap_count() {
        let step = 1u32 << 24;
        let mut space = SequenceSpace::new();
        let mut seq = 0x1000u32;
        for k in 0..512 {
            let class = space.classify(seq, step);
            assert_eq!(class.rexmit_bytes, 0, "segment {} was not new", k);
            seq = seq.wrapping_add(step);
            if k == 159 {
                assert!(space.quadrant(1).unwrap().is_full());
                assert_eq!(space.summary().full_quadrants, 1);
            }
            if k == 254 {
                assert_eq!(space.wrap_count(), 0);
            }
        }
        assert_eq!(space.wrap_count(), 2);
        assert_eq!(space.summary().wrap_count, 2);
    }

    #[test]
    fn test_retransmission_matches_byte_model() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = 10_000u32;
        for _round in 0..20 {
            let mut space = SequenceSpace::new();
            let mut sent = vec![false; 6000];
            for _ in 0..200 {
                let offset = rng.random_range(0..5800u32);
                let len = rng.random_range(1..200u32);
                let expected = (offset..offset + len).filter(|b| sent[*b as usize]).count() as u32;
                let class = space.classify(base + offset, len);
                assert_eq!(class.rexmit_bytes, expected);
                for b in offset..offset + len {
                    sent[b as usize] = true;
                }

                let intervals = space.intervals_at(base);
                for pair in intervals.windows(2) {
                    assert!(pair[0].begin <= pair[0].end);
                    assert!((pair[0].end as u64) + 1 < pair[1].begin as u64);
                }
                let covered: u64 = intervals.iter().map(|i| i.span()).sum();
                assert_eq!(covered, sent.iter().filter(|b| **b).count() as u64);
            }
        }
    }

    #[test]
    fn test_clear() {
        let mut space = SequenceSpace::new();
        space.classify(1, 100);
        space.clear();
        assert_eq!(space.summary(), SpaceSummary::default());
    }
}
