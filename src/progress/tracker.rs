//! In-memory, run-partitioned progress tracking.
//!
//! State is keyed by run id and mutated only by that run's executing phase
//! handler, so partitions never contend. Cancellation is a cooperative flag:
//! it is checked between sections and between refinement iterations, never
//! preempting an in-flight backend call.

use crate::pipeline::run::{PhaseStatus, PipelineRun, RunStatus};
use crate::progress::event::ProgressEvent;
use crate::types::now_millis;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Cooperative cancellation flag handed to phase handlers.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct RunPartition {
    run: RwLock<PipelineRun>,
    events: RwLock<Vec<ProgressEvent>>,
    next_seq: AtomicU64,
    cancel: CancelToken,
}

impl RunPartition {
    fn new(run: PipelineRun) -> Self {
        Self {
            run: RwLock::new(run),
            events: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(1),
            cancel: CancelToken::new(),
        }
    }
}

pub struct ProgressTracker {
    runs: RwLock<HashMap<String, Arc<RunPartition>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a run and hand back its cancellation token.
    pub fn start(&self, run: PipelineRun) -> CancelToken {
        let run_id = run.run_id.clone();
        let partition = Arc::new(RunPartition::new(run));
        let token = partition.cancel.clone();
        self.runs.write().insert(run_id, partition);
        token
    }

    /// Update one phase record; ignored for unknown runs.
    pub fn update(&self, run_id: &str, phase_index: usize, status: PhaseStatus) {
        if let Some(partition) = self.partition(run_id) {
            let mut run = partition.run.write();
            if let Some(record) = run.phases.get_mut(phase_index) {
                record.status = status;
            }
        }
    }

    /// Apply an arbitrary mutation under the run's single-writer discipline.
    pub fn with_run<F>(&self, run_id: &str, mutate: F)
    where
        F: FnOnce(&mut PipelineRun),
    {
        if let Some(partition) = self.partition(run_id) {
            mutate(&mut partition.run.write());
        }
    }

    /// Snapshot of the run's current state.
    pub fn get(&self, run_id: &str) -> Option<PipelineRun> {
        self.partition(run_id).map(|p| p.run.read().clone())
    }

    /// Request cooperative cancellation. Returns false for unknown or already
    /// terminal runs.
    pub fn cancel(&self, run_id: &str) -> bool {
        let Some(partition) = self.partition(run_id) else {
            return false;
        };
        {
            let mut run = partition.run.write();
            if run.status.is_terminal() {
                return false;
            }
            run.cancel_requested = true;
        }
        partition.cancel.set();
        true
    }

    pub fn cancel_token(&self, run_id: &str) -> Option<CancelToken> {
        self.partition(run_id).map(|p| p.cancel.clone())
    }

    pub fn list_active(&self) -> Vec<PipelineRun> {
        let runs = self.runs.read();
        let mut active: Vec<PipelineRun> = runs
            .values()
            .map(|p| p.run.read().clone())
            .filter(|r| matches!(r.status, RunStatus::Created | RunStatus::Running))
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// Append an event to the run's ordered log.
    pub fn emit_event(&self, run_id: &str, event_type: &str, data: Value) -> bool {
        let Some(partition) = self.partition(run_id) else {
            return false;
        };
        let seq = partition.next_seq.fetch_add(1, Ordering::Relaxed);
        partition.events.write().push(ProgressEvent {
            ts: now_millis(),
            run: run_id.to_string(),
            seq,
            event_type: event_type.to_string(),
            data,
        });
        true
    }

    pub fn emit_event_best_effort(&self, run_id: &str, event_type: &str, data: Value) {
        if !self.emit_event(run_id, event_type, data) {
            warn!(
                run_id = %run_id,
                event_type = %event_type,
                "dropped progress event for unknown run"
            );
        }
    }

    pub fn events(&self, run_id: &str) -> Vec<ProgressEvent> {
        self.events_after(run_id, 0)
    }

    /// Events with seq greater than `after_seq`, in order.
    pub fn events_after(&self, run_id: &str, after_seq: u64) -> Vec<ProgressEvent> {
        let Some(partition) = self.partition(run_id) else {
            return Vec::new();
        };
        let events = partition.events.read();
        events
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect()
    }

    fn partition(&self, run_id: &str) -> Option<Arc<RunPartition>> {
        self.runs.read().get(run_id).cloned()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracked_run(tracker: &ProgressTracker, run_id: &str) -> CancelToken {
        tracker.start(PipelineRun::new(run_id.to_string()))
    }

    #[test]
    fn start_and_get_round_trip() {
        let tracker = ProgressTracker::new();
        tracked_run(&tracker, "run-a");
        let snapshot = tracker.get("run-a").unwrap();
        assert_eq!(snapshot.run_id, "run-a");
        assert_eq!(snapshot.phases.len(), 5);
        assert!(tracker.get("run-missing").is_none());
    }

    #[test]
    fn update_mutates_one_phase_record() {
        let tracker = ProgressTracker::new();
        tracked_run(&tracker, "run-a");
        tracker.update("run-a", 0, PhaseStatus::Running);
        let snapshot = tracker.get("run-a").unwrap();
        assert_eq!(snapshot.phases[0].status, PhaseStatus::Running);
        assert_eq!(snapshot.phases[1].status, PhaseStatus::Pending);
        // Unknown runs and out-of-range indexes are ignored.
        tracker.update("run-missing", 0, PhaseStatus::Running);
        tracker.update("run-a", 9, PhaseStatus::Running);
    }

    #[test]
    fn cancel_sets_cooperative_flag() {
        let tracker = ProgressTracker::new();
        let token = tracked_run(&tracker, "run-a");
        assert!(!token.is_cancelled());
        assert!(tracker.cancel("run-a"));
        assert!(token.is_cancelled());
        assert!(tracker.get("run-a").unwrap().cancel_requested);
        assert!(!tracker.cancel("run-missing"));
    }

    #[test]
    fn cancel_refuses_terminal_runs() {
        let tracker = ProgressTracker::new();
        tracked_run(&tracker, "run-a");
        tracker.with_run("run-a", |run| run.status = RunStatus::Completed);
        assert!(!tracker.cancel("run-a"));
    }

    #[test]
    fn list_active_excludes_terminal_runs() {
        let tracker = ProgressTracker::new();
        tracked_run(&tracker, "run-a");
        tracked_run(&tracker, "run-b");
        tracker.with_run("run-b", |run| run.status = RunStatus::Failed);
        let active = tracker.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id, "run-a");
    }

    #[test]
    fn events_are_ordered_and_filterable() {
        let tracker = ProgressTracker::new();
        tracked_run(&tracker, "run-a");
        tracker.emit_event("run-a", "run_started", json!({}));
        tracker.emit_event("run-a", "phase_started", json!({ "phase_index": 0 }));
        tracker.emit_event("run-a", "phase_completed", json!({ "phase_index": 0 }));

        let all = tracker.events("run-a");
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));

        let tail = tracker.events_after("run-a", all[1].seq);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event_type, "phase_completed");
    }

    #[test]
    fn partitions_are_isolated_per_run() {
        let tracker = ProgressTracker::new();
        tracked_run(&tracker, "run-a");
        tracked_run(&tracker, "run-b");
        tracker.emit_event("run-a", "run_started", json!({}));
        assert_eq!(tracker.events("run-a").len(), 1);
        assert!(tracker.events("run-b").is_empty());
        assert!(tracker.cancel("run-a"));
        assert!(!tracker.cancel_token("run-b").unwrap().is_cancelled());
    }
}
