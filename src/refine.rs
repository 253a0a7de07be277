//! Quality-gated refinement loop for one section.
//!
//! Generate an initial candidate, score it, and keep regenerating from the
//! best report's deltas until the quality gate is met, the score plateaus, or
//! the iteration budget runs out. The best-scoring candidate is always
//! retained, so the retained score never regresses. Budget exhaustion below
//! the gate is a normal outcome, not an error.

use crate::error::PipelineError;
use crate::generate::{ContentGenerator, GenerationContext};
use crate::progress::{CancelToken, ProgressTracker, SectionEventData};
use crate::recovery::{ErrorRecoverySystem, RetryPolicy};
use crate::score::QualityScorer;
use crate::section::{
    GenerationAttempt, QualityImprovement, QualityReport, Section,
};
use crate::split::fields_from_markup;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of refining one section.
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub section: Section,
    pub attempts: Vec<GenerationAttempt>,
    /// True when the loop stopped early on a score plateau.
    pub converged: bool,
    pub improvement: QualityImprovement,
    pub report: QualityReport,
}

pub struct RefinementLoop {
    generator: ContentGenerator,
    scorer: QualityScorer,
    recovery: Arc<ErrorRecoverySystem>,
    retry_policy: RetryPolicy,
    plateau_epsilon: f64,
}

impl RefinementLoop {
    pub fn new(
        generator: ContentGenerator,
        scorer: QualityScorer,
        recovery: Arc<ErrorRecoverySystem>,
        retry_policy: RetryPolicy,
        plateau_epsilon: f64,
    ) -> Self {
        Self {
            generator,
            scorer,
            recovery,
            retry_policy,
            plateau_epsilon,
        }
    }

    pub async fn refine(
        &self,
        section: Section,
        context: &GenerationContext,
        tracker: Option<&ProgressTracker>,
        cancel: &CancelToken,
        max_iterations: usize,
        quality_threshold: f64,
    ) -> Result<RefinementOutcome, PipelineError> {
        let mut attempts = Vec::new();

        // Initial candidate.
        let mut attempt = self
            .recovery
            .with_retry(&self.retry_policy, || {
                self.generator.generate(&section, context, 0, None)
            })
            .await?;
        let report = self.scorer.score(&attempt.candidate_html, &attempt.candidate_css);
        attempt.score = report.composite;
        let initial_score = report.composite;
        self.emit_iteration(tracker, context, &section, 0, initial_score);

        let mut best: (GenerationAttempt, QualityReport) = (attempt.clone(), report);
        attempts.push(attempt);
        // Best-so-far after each completed iteration; index 0 is the initial
        // candidate.
        let mut best_history = vec![initial_score];
        let mut converged = false;

        let mut iteration = 1usize;
        while best.1.composite < quality_threshold && iteration <= max_iterations {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let prior_attempt = best.0.clone();
            let prior_report = best.1.clone();
            let mut attempt = self
                .recovery
                .with_retry(&self.retry_policy, || {
                    self.generator.generate(
                        &section,
                        context,
                        iteration,
                        Some((&prior_attempt, &prior_report)),
                    )
                })
                .await?;
            let report = self.scorer.score(&attempt.candidate_html, &attempt.candidate_css);
            attempt.score = report.composite;
            self.emit_iteration(tracker, context, &section, iteration, report.composite);

            if report.composite > best.1.composite {
                best = (attempt.clone(), report);
            }
            attempts.push(attempt);
            best_history.push(best.1.composite);

            // Plateau: best score moved less than epsilon over the last two
            // completed iterations.
            let n = best_history.len();
            if n >= 3 && best_history[n - 1] - best_history[n - 3] < self.plateau_epsilon {
                converged = true;
                debug!(
                    section_id = %section.id,
                    iterations = iteration,
                    best_score = best.1.composite,
                    "refinement plateaued"
                );
                break;
            }

            iteration += 1;
        }

        let (best_attempt, best_report) = best;
        let mut section = section;
        section.html = best_attempt.candidate_html.clone();
        section.css = best_attempt.candidate_css.clone();
        let generated_fields = fields_from_markup(&section.html);
        if !generated_fields.is_empty() {
            section.editable_fields = generated_fields;
        }
        section.dedupe_fields();
        section.quality_score = best_report.composite;

        let improvement = QualityImprovement {
            before: initial_score,
            after: best_report.composite,
            improvement: best_report.composite - initial_score,
        };

        info!(
            section_id = %section.id,
            attempts = attempts.len(),
            before = improvement.before,
            after = improvement.after,
            converged,
            gate_met = best_report.meets(quality_threshold),
            "section refinement finished"
        );

        Ok(RefinementOutcome {
            section,
            attempts,
            converged,
            improvement,
            report: best_report,
        })
    }

    fn emit_iteration(
        &self,
        tracker: Option<&ProgressTracker>,
        context: &GenerationContext,
        section: &Section,
        iteration: usize,
        score: f64,
    ) {
        if let Some(tracker) = tracker {
            tracker.emit_event_best_effort(
                &context.run_id,
                "refinement_iteration",
                json!(SectionEventData {
                    section_id: section.id.clone(),
                    section_type: section.section_type.as_str().to_string(),
                    iteration: Some(iteration),
                    score: Some(score),
                    error: None,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::pipeline::run::PipelineRun;
    use crate::section::SectionType;

    const POOR: &str = "```html\n<div><p>text</div>\n```";
    const MEDIOCRE: &str = "```html\n<div><p data-field=\"body\">text</p></div>\n```";
    const STRONG: &str = "```html\n<header><h1 data-field=\"title\">T</h1>\
                          <p data-field=\"tagline\">x</p></header>\n```\n\
                          ```css\nheader { display: flex; }\n```";

    fn test_loop(replies: Vec<&str>, epsilon: f64) -> RefinementLoop {
        let backend = Arc::new(ScriptedBackend::new(
            replies.into_iter().map(String::from).collect(),
        ));
        RefinementLoop::new(
            ContentGenerator::new(backend),
            QualityScorer::new(),
            Arc::new(ErrorRecoverySystem::new()),
            RetryPolicy {
                max_attempts: 1,
                base_delay_ms: 1,
                backoff_multiplier: 1.0,
            },
            epsilon,
        )
    }

    fn context() -> GenerationContext {
        GenerationContext {
            run_id: "run-1".to_string(),
            source_name: "design.html".to_string(),
        }
    }

    fn cancel_token() -> CancelToken {
        ProgressTracker::new().start(PipelineRun::new("run-x".to_string()))
    }

    #[tokio::test]
    async fn stops_once_gate_is_met() {
        let refinement = test_loop(vec![STRONG], 1.0);
        let outcome = refinement
            .refine(
                Section::new("s1".to_string(), SectionType::Header),
                &context(),
                None,
                &cancel_token(),
                5,
                80.0,
            )
            .await
            .unwrap();
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.report.meets(80.0));
        assert!(!outcome.converged);
    }

    #[tokio::test]
    async fn retained_best_score_is_monotone() {
        // Second reply is worse than the first; the loop must keep the best.
        let refinement = test_loop(vec![MEDIOCRE, POOR, STRONG], 0.0001);
        let outcome = refinement
            .refine(
                Section::new("s1".to_string(), SectionType::Content),
                &context(),
                None,
                &cancel_token(),
                5,
                95.0,
            )
            .await
            .unwrap();

        let mut best_so_far = f64::MIN;
        for attempt in &outcome.attempts {
            let retained = outcome.attempts[..=attempt.iteration]
                .iter()
                .map(|a| a.score)
                .fold(f64::MIN, f64::max);
            assert!(retained >= best_so_far);
            best_so_far = retained;
        }
        assert!(outcome.improvement.after >= outcome.improvement.before);
        assert_eq!(outcome.section.quality_score, outcome.report.composite);
    }

    #[tokio::test]
    async fn plateau_reports_convergence() {
        // Identical mediocre candidates: no improvement over two iterations.
        let refinement = test_loop(vec![MEDIOCRE, MEDIOCRE, MEDIOCRE, MEDIOCRE], 0.5);
        let outcome = refinement
            .refine(
                Section::new("s1".to_string(), SectionType::Content),
                &context(),
                None,
                &cancel_token(),
                10,
                99.0,
            )
            .await
            .unwrap();
        assert!(outcome.converged);
        assert!(outcome.attempts.len() < 10);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_a_normal_outcome() {
        let refinement = test_loop(vec![POOR, MEDIOCRE], 0.0);
        let outcome = refinement
            .refine(
                Section::new("s1".to_string(), SectionType::Content),
                &context(),
                None,
                &cancel_token(),
                1,
                99.0,
            )
            .await
            .unwrap();
        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.report.meets(99.0));
        assert!(outcome.improvement.improvement >= 0.0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_between_iterations() {
        let refinement = test_loop(vec![POOR, MEDIOCRE, STRONG], 0.0001);
        let tracker = ProgressTracker::new();
        let token = tracker.start(PipelineRun::new("run-1".to_string()));
        tracker.cancel("run-1");
        let err = refinement
            .refine(
                Section::new("s1".to_string(), SectionType::Content),
                &context(),
                None,
                &token,
                5,
                99.0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn generated_fields_replace_splitter_fields() {
        let refinement = test_loop(vec![STRONG], 0.0);
        let outcome = refinement
            .refine(
                Section::new("s1".to_string(), SectionType::Header),
                &context(),
                None,
                &cancel_token(),
                3,
                50.0,
            )
            .await
            .unwrap();
        let ids: Vec<&str> = outcome
            .section
            .editable_fields
            .iter()
            .map(|f| f.id.as_str())
            .collect();
        assert_eq!(ids, vec!["title", "tagline"]);
    }
}
