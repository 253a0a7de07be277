//! The five-phase pipeline executor.
//!
//! Phases run strictly sequentially for a run; independent sections inside
//! the AI Generation phase run on a bounded worker pool. Cancellation is
//! cooperative and checked between phases, sections and refinement
//! iterations. Input-contract violations fail before any phase starts; every
//! later failure is returned as a terminal run carrying phase, kind, message
//! and a remediation hint, with completed section data preserved.

use crate::assemble::{aggregate_score, Assembler};
use crate::backend::GenerativeBackend;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::generate::{ContentGenerator, GenerationContext};
use crate::input::DesignInput;
use crate::pipeline::run::{PhaseName, PhaseStatus, PipelineRun, RunFailure, RunStatus};
use crate::progress::{CancelToken, PhaseEventData, ProgressTracker, RunEndedData, SectionEventData};
use crate::recovery::ErrorRecoverySystem;
use crate::refine::RefinementLoop;
use crate::schema::{FieldSchema, ModuleDescriptor, SchemaCompatibility, SchemaValidator};
use crate::score::QualityScorer;
use crate::section::Section;
use crate::split::SectionSplitter;
use crate::types::{new_run_id, now_millis};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub struct PipelineExecutor {
    splitter: SectionSplitter,
    refinement: RefinementLoop,
    schema: FieldSchema,
    tracker: Arc<ProgressTracker>,
    recovery: Arc<ErrorRecoverySystem>,
    config: PipelineConfig,
}

impl PipelineExecutor {
    /// Explicit construction at process start; no hidden singletons. The
    /// tracker and recovery system are shared with the caller so runs stay
    /// observable and recovery statistics accumulate across runs.
    pub fn new(
        backend: Arc<dyn GenerativeBackend>,
        schema: FieldSchema,
        tracker: Arc<ProgressTracker>,
        recovery: Arc<ErrorRecoverySystem>,
        config: PipelineConfig,
    ) -> Self {
        let refinement = RefinementLoop::new(
            ContentGenerator::new(backend),
            QualityScorer::new(),
            recovery.clone(),
            config.retry.clone(),
            config.plateau_epsilon,
        );
        Self {
            splitter: SectionSplitter::new(),
            refinement,
            schema,
            tracker,
            recovery,
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoverySystem> {
        &self.recovery
    }

    /// Run the full pipeline over one design asset.
    ///
    /// Returns `Err(InputInvalid)` for contract violations — no run is
    /// registered and no phase starts. Any input that passes the gate yields
    /// `Ok(run)`, including failed and cancelled runs.
    pub async fn execute(
        &self,
        design_bytes: &[u8],
        filename: &str,
        mime_type: &str,
    ) -> Result<PipelineRun, PipelineError> {
        let input = DesignInput::from_upload(design_bytes, filename, mime_type)?;

        let run_id = new_run_id();
        let mut run = PipelineRun::new(run_id.clone());
        run.status = RunStatus::Running;
        run.metadata
            .insert("filename".to_string(), filename.to_string());
        run.metadata
            .insert("mime_type".to_string(), mime_type.to_string());
        run.metadata.insert(
            "module_label".to_string(),
            self.config.module_label.clone(),
        );

        let started = Instant::now();
        let cancel = self.tracker.start(run.clone());
        self.tracker.emit_event_best_effort(
            &run_id,
            "run_started",
            json!({ "source": filename, "byte_len": input.byte_len }),
        );
        info!(run_id = %run_id, filename = %filename, mime_type = %mime_type, "pipeline run started");

        let context = GenerationContext {
            run_id: run_id.clone(),
            source_name: filename.to_string(),
        };

        let mut sections: Vec<Section> = Vec::new();
        let mut compat: Option<SchemaCompatibility> = None;

        for phase in PhaseName::ALL {
            let index = phase.index();

            // Cooperative cancellation between phases: the not-yet-started
            // phases are skipped, nothing is marked failed.
            if cancel.is_cancelled() {
                run.skip_phases_from(index);
                run.status = RunStatus::Cancelled;
                break;
            }

            let phase_clock = Instant::now();
            run.begin_phase(index, now_millis())?;
            self.mirror(&run);
            self.emit_phase(&run_id, phase, index, PhaseStatus::Running, None, None);

            let result = match phase {
                PhaseName::SectionDetection => self.phase_detect(&input, &mut sections).await,
                PhaseName::AiGeneration => {
                    self.phase_generate(&context, &cancel, &mut sections, &mut run)
                        .await
                }
                PhaseName::QualityVerification => {
                    self.phase_verify(&run_id, &sections, &mut run, &mut compat)
                }
                PhaseName::TemplateMapping => self.phase_map(&run_id, &mut run, &sections),
                PhaseName::FinalAssembly => self.phase_assemble(&mut run, &sections, compat.take()),
            };

            let duration_ms = phase_clock.elapsed().as_millis() as u64;
            match result {
                Ok(()) => {
                    run.finish_phase(index, PhaseStatus::Completed, duration_ms, None);
                    self.emit_phase(
                        &run_id,
                        phase,
                        index,
                        PhaseStatus::Completed,
                        Some(duration_ms),
                        None,
                    );
                    self.mirror(&run);
                }
                Err(PipelineError::Cancelled) => {
                    // Cancelled mid-phase: the interrupted phase failed by
                    // cancellation, the rest never run.
                    run.finish_phase(
                        index,
                        PhaseStatus::Failed,
                        duration_ms,
                        Some("cancelled".to_string()),
                    );
                    run.skip_phases_from(index + 1);
                    run.status = RunStatus::Cancelled;
                    self.emit_phase(
                        &run_id,
                        phase,
                        index,
                        PhaseStatus::Failed,
                        Some(duration_ms),
                        Some("cancelled".to_string()),
                    );
                    break;
                }
                Err(error) => {
                    warn!(
                        run_id = %run_id,
                        phase = phase.as_str(),
                        error = %error,
                        "phase failed"
                    );
                    run.finish_phase(
                        index,
                        PhaseStatus::Failed,
                        duration_ms,
                        Some(error.to_string()),
                    );
                    run.skip_phases_from(index + 1);
                    run.status = RunStatus::Failed;
                    run.failure = Some(RunFailure::from_error(phase, &error));
                    self.emit_phase(
                        &run_id,
                        phase,
                        index,
                        PhaseStatus::Failed,
                        Some(duration_ms),
                        Some(error.to_string()),
                    );
                    break;
                }
            }
        }

        if run.status == RunStatus::Running {
            run.status = RunStatus::Completed;
        }
        run.cancel_requested = cancel.is_cancelled();
        run.processing_time_ms = started.elapsed().as_millis() as u64;
        run.ended_at = Some(Utc::now());

        let end_event = match run.status {
            RunStatus::Completed => "run_completed",
            RunStatus::Cancelled => "run_cancelled",
            _ => "run_failed",
        };
        self.tracker.emit_event_best_effort(
            &run_id,
            end_event,
            json!(RunEndedData {
                status: format!("{:?}", run.status).to_lowercase(),
                error: run.failure.as_ref().map(|f| f.message.clone()),
            }),
        );
        self.mirror(&run);

        info!(
            run_id = %run_id,
            status = ?run.status,
            quality_score = run.quality_score,
            duration_ms = run.processing_time_ms,
            "pipeline run finished"
        );
        Ok(run)
    }

    /// Phase 1: Section Detection. Zero sections is a deterministic, distinct
    /// failure, never a silently empty success.
    async fn phase_detect(
        &self,
        input: &DesignInput,
        sections: &mut Vec<Section>,
    ) -> Result<(), PipelineError> {
        let detected = self
            .recovery
            .with_retry(&self.config.retry, || async {
                let detected = self.splitter.split(input);
                if detected.is_empty() {
                    Err(PipelineError::NoSectionsDetected)
                } else {
                    Ok(detected)
                }
            })
            .await?;
        *sections = detected;
        Ok(())
    }

    /// Phase 2: AI Generation. Independent sections go through the refinement
    /// loop on a bounded worker pool; outputs are merged back into detection
    /// order. Sections refined before a failure stay on the run for
    /// diagnostics.
    async fn phase_generate(
        &self,
        context: &GenerationContext,
        cancel: &CancelToken,
        sections: &mut Vec<Section>,
        run: &mut PipelineRun,
    ) -> Result<(), PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sections));
        let mut pool = FuturesUnordered::new();

        for (index, section) in sections.drain(..).enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let section_id = section.id.clone();
            let section_type = section.section_type;
            self.tracker.emit_event_best_effort(
                &context.run_id,
                "section_generation_started",
                json!(SectionEventData {
                    section_id: section_id.clone(),
                    section_type: section_type.as_str().to_string(),
                    iteration: None,
                    score: None,
                    error: None,
                }),
            );
            pool.push(async move {
                let outcome = match semaphore.acquire().await {
                    Ok(_permit) => {
                        self.refinement
                            .refine(
                                section,
                                context,
                                Some(self.tracker.as_ref()),
                                cancel,
                                self.config.max_refinement_iterations,
                                self.config.quality_threshold,
                            )
                            .await
                    }
                    Err(_) => Err(PipelineError::Internal(
                        "section worker pool closed".to_string(),
                    )),
                };
                (index, section_id, section_type, outcome)
            });
        }

        let mut refined: Vec<(usize, Section)> = Vec::new();
        let mut failure: Option<PipelineError> = None;
        let mut cancelled = false;

        while let Some((index, section_id, section_type, outcome)) = pool.next().await {
            match outcome {
                Ok(outcome) => {
                    self.tracker.emit_event_best_effort(
                        &context.run_id,
                        "section_generation_completed",
                        json!(SectionEventData {
                            section_id,
                            section_type: section_type.as_str().to_string(),
                            iteration: Some(outcome.attempts.len().saturating_sub(1)),
                            score: Some(outcome.section.quality_score),
                            error: None,
                        }),
                    );
                    refined.push((index, outcome.section));
                }
                Err(error) => {
                    self.tracker.emit_event_best_effort(
                        &context.run_id,
                        "section_generation_failed",
                        json!(SectionEventData {
                            section_id,
                            section_type: section_type.as_str().to_string(),
                            iteration: None,
                            score: None,
                            error: Some(error.to_string()),
                        }),
                    );
                    if matches!(error, PipelineError::Cancelled) {
                        cancelled = true;
                    } else if failure.is_none() {
                        failure = Some(error);
                    }
                }
            }
        }

        refined.sort_by_key(|(index, _)| *index);
        let refined: Vec<Section> = refined.into_iter().map(|(_, section)| section).collect();
        run.sections = refined.clone();

        if cancelled {
            return Err(PipelineError::Cancelled);
        }
        if let Some(error) = failure {
            return Err(error);
        }
        *sections = refined;
        Ok(())
    }

    /// Phase 3: Quality Verification. Aggregates section scores and checks
    /// the module against the schema vocabulary. Quality errors/warnings are
    /// results, not exceptions: a degraded section never aborts the run here.
    fn phase_verify(
        &self,
        run_id: &str,
        sections: &[Section],
        run: &mut PipelineRun,
        compat: &mut Option<SchemaCompatibility>,
    ) -> Result<(), PipelineError> {
        run.quality_score = aggregate_score(sections);

        let descriptor = self.module_descriptor(sections);
        let verdict = SchemaValidator::check(&descriptor, &self.schema);
        for issue in &verdict.issues {
            warn!(run_id = %run_id, issue = %issue, "schema issue");
        }
        self.tracker.emit_event_best_effort(
            run_id,
            "schema_checked",
            json!({
                "schema_version": verdict.schema_version,
                "compatible": verdict.compatible,
                "issues": verdict.issues,
            }),
        );
        *compat = Some(verdict);
        Ok(())
    }

    /// Phase 4: Template Mapping. Reconciles section fields against the
    /// target field-type vocabulary, annotating incompatibilities without
    /// aborting the run.
    fn phase_map(
        &self,
        run_id: &str,
        run: &mut PipelineRun,
        sections: &[Section],
    ) -> Result<(), PipelineError> {
        let mut annotations = Vec::new();
        for section in sections {
            for field in &section.editable_fields {
                let declared = field.field_type.as_str();
                if !self.schema.valid_field_types.iter().any(|t| t == declared) {
                    annotations.push(format!(
                        "{}/{}: field type '{}' has no mapping in schema {}",
                        section.id, field.id, declared, self.schema.version
                    ));
                }
            }
        }

        if !annotations.is_empty() {
            for annotation in &annotations {
                warn!(run_id = %run_id, annotation = %annotation, "template mapping incompatibility");
            }
            run.metadata.insert(
                "template_mapping_issues".to_string(),
                annotations.join("; "),
            );
        }
        self.tracker.emit_event_best_effort(
            run_id,
            "template_mapped",
            json!({ "annotation_count": annotations.len(), "annotations": annotations }),
        );
        Ok(())
    }

    /// Phase 5: Final Assembly. Schema incompatibility fails the phase while
    /// the assembled package and section data stay on the run for
    /// diagnostics.
    fn phase_assemble(
        &self,
        run: &mut PipelineRun,
        sections: &[Section],
        compat: Option<SchemaCompatibility>,
    ) -> Result<(), PipelineError> {
        let compat = compat.unwrap_or_else(|| {
            SchemaValidator::check(&self.module_descriptor(sections), &self.schema)
        });

        let mut metadata = HashMap::new();
        metadata.insert("label".to_string(), self.config.module_label.clone());
        metadata.insert(
            "content_types".to_string(),
            self.config.content_types.join(","),
        );

        let package = Assembler::assemble(sections.to_vec(), compat.clone(), metadata);
        run.quality_score = package.aggregate_quality_score;
        run.package = Some(package);

        if !compat.compatible {
            return Err(PipelineError::SchemaIncompatible {
                version: compat.schema_version,
                issue_count: compat.issues.len(),
            });
        }
        Ok(())
    }

    fn module_descriptor(&self, sections: &[Section]) -> ModuleDescriptor {
        ModuleDescriptor {
            label: self.config.module_label.clone(),
            fields: sections
                .iter()
                .flat_map(|s| s.editable_fields.iter())
                .map(Into::into)
                .collect(),
            content_types: self.config.content_types.clone(),
        }
    }

    fn mirror(&self, run: &PipelineRun) {
        self.tracker.with_run(&run.run_id, |tracked| {
            // A cancellation request recorded on the tracked copy survives
            // the mirror.
            let cancel_requested = tracked.cancel_requested || run.cancel_requested;
            *tracked = run.clone();
            tracked.cancel_requested = cancel_requested;
        });
    }

    fn emit_phase(
        &self,
        run_id: &str,
        phase: PhaseName,
        phase_index: usize,
        status: PhaseStatus,
        duration_ms: Option<u64>,
        error: Option<String>,
    ) {
        let event_type = match status {
            PhaseStatus::Running => "phase_started",
            PhaseStatus::Failed => "phase_failed",
            _ => "phase_completed",
        };
        self.tracker.emit_event_best_effort(
            run_id,
            event_type,
            json!(PhaseEventData {
                phase: phase.as_str().to_string(),
                phase_index,
                status: status.as_str().to_string(),
                duration_ms,
                error,
            }),
        );
    }
}
