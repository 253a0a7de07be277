//! Pipeline run state: five fixed phases, run status, invariants.

use crate::error::{ErrorKind, PipelineError};
use crate::section::{ModulePackage, Section};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The five orchestration phases, in execution order. The set and order never
/// vary between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    SectionDetection,
    AiGeneration,
    QualityVerification,
    TemplateMapping,
    FinalAssembly,
}

impl PhaseName {
    pub const ALL: [PhaseName; 5] = [
        PhaseName::SectionDetection,
        PhaseName::AiGeneration,
        PhaseName::QualityVerification,
        PhaseName::TemplateMapping,
        PhaseName::FinalAssembly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseName::SectionDetection => "Section Detection",
            PhaseName::AiGeneration => "AI Generation",
            PhaseName::QualityVerification => "Quality Verification",
            PhaseName::TemplateMapping => "Template Mapping",
            PhaseName::FinalAssembly => "Final Assembly",
        }
    }

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|p| *p == self).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: PhaseName,
    pub status: PhaseStatus,
    pub started_at_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl PhaseRecord {
    fn pending(name: PhaseName) -> Self {
        Self {
            name,
            status: PhaseStatus::Pending,
            started_at_ms: None,
            duration_ms: None,
            error: None,
        }
    }
}

/// Failure details attached to a run that ended in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub phase: PhaseName,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub suggestion: String,
}

impl RunFailure {
    pub fn from_error(phase: PhaseName, error: &PipelineError) -> Self {
        Self {
            phase,
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            suggestion: error.suggestion().to_string(),
        }
    }
}

/// One pipeline run. Mutated only by the currently executing phase handler;
/// immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub status: RunStatus,
    pub cancel_requested: bool,
    pub phases: Vec<PhaseRecord>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub sections: Vec<Section>,
    pub quality_score: f64,
    pub processing_time_ms: u64,
    pub metadata: HashMap<String, String>,
    pub failure: Option<RunFailure>,
    /// Assembled output, present once Final Assembly has run (kept even when
    /// that phase fails on schema incompatibility, for diagnostics).
    pub package: Option<ModulePackage>,
}

impl PipelineRun {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            status: RunStatus::Created,
            cancel_requested: false,
            phases: PhaseName::ALL.iter().map(|p| PhaseRecord::pending(*p)).collect(),
            started_at: Utc::now(),
            ended_at: None,
            sections: Vec::new(),
            quality_score: 0.0,
            processing_time_ms: 0,
            metadata: HashMap::new(),
            failure: None,
            package: None,
        }
    }

    /// Phase `i` cannot start until phase `i-1` is terminal.
    pub fn can_start_phase(&self, index: usize) -> bool {
        if index >= self.phases.len() {
            return false;
        }
        if index == 0 {
            return self.phases[0].status == PhaseStatus::Pending;
        }
        self.phases[index - 1].status.is_terminal()
            && self.phases[index].status == PhaseStatus::Pending
    }

    pub fn begin_phase(&mut self, index: usize, now_ms: u64) -> Result<(), PipelineError> {
        if !self.can_start_phase(index) {
            return Err(PipelineError::Internal(format!(
                "phase {index} cannot start before its predecessor is terminal"
            )));
        }
        let record = &mut self.phases[index];
        record.status = PhaseStatus::Running;
        record.started_at_ms = Some(now_ms);
        Ok(())
    }

    pub fn finish_phase(
        &mut self,
        index: usize,
        status: PhaseStatus,
        duration_ms: u64,
        error: Option<String>,
    ) {
        if let Some(record) = self.phases.get_mut(index) {
            record.status = status;
            record.duration_ms = Some(duration_ms);
            record.error = error;
        }
    }

    /// Mark every phase at or after `from_index` as skipped.
    pub fn skip_phases_from(&mut self, from_index: usize) {
        for record in self.phases.iter_mut().skip(from_index) {
            if !record.status.is_terminal() {
                record.status = PhaseStatus::Skipped;
            }
        }
    }

    pub fn completed_phase_count(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .count()
    }
}
