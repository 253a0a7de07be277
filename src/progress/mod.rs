//! Run progress observability.
//!
//! Per-run state partitions with a cooperative cancellation flag and an
//! ordered event log. Progress derives solely from actual phase/iteration
//! completion; there are no timer-driven counters.

pub mod event;
pub mod tracker;

pub use event::{PhaseEventData, ProgressEvent, RunEndedData, SectionEventData};
pub use tracker::{CancelToken, ProgressTracker};
