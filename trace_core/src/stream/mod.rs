pub mod flow;
pub mod rtt;
pub mod seqspace;
pub mod tracker;

pub use flow::{Direction, DirectionState, DirectionSummary, Flow, FlowKey, FlowSummary};
pub use rtt::{AckClass, AckCounters, AckTracker, OutstandingSegment, RttStats};
pub use seqspace::{
    seq_cmp, seq_geq, seq_gt, seq_leq, seq_lt, Quadrant, SegmentClass, SentInterval, SequenceSpace,
    SpaceSummary, QUAD_SIZE,
};
pub use tracker::{ConnectionTracker, Lookup, PacketEvent, TrackerStats};
