//! Pipeline orchestration: run state machine and the five-phase executor.

pub mod executor;
pub mod run;

pub use executor::PipelineExecutor;
pub use run::{PhaseName, PhaseRecord, PhaseStatus, PipelineRun, RunFailure, RunStatus};
