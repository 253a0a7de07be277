//! End-to-end pipeline tests driven through scripted backends.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weave::backend::{BackendResponse, GenerateRequest, GenerativeBackend};
use weave::config::PipelineConfig;
use weave::error::{ErrorKind, PipelineError};
use weave::pipeline::{PhaseStatus, PipelineExecutor, RunStatus};
use weave::progress::ProgressTracker;
use weave::recovery::{ErrorRecoverySystem, RetryPolicy};
use weave::schema::{FieldSchema, ModuleDescriptor, SchemaValidator};
use weave::score::QualityScorer;
use weave::section::TokenUsage;

const HEADER_REPLY: &str = "```html\n<header><h1 data-field=\"title\">Acme</h1></header>\n```\n```css\nheader { display: flex; }\n```";
const NAV_REPLY: &str = "```html\n<nav><a href=\"/\" data-field=\"home_link\">Home</a></nav>\n```\n```css\nnav { gap: 1rem; }\n```";
const HERO_REPLY: &str = "```html\n<section class=\"hero\"><h2 data-field=\"title\">Big claim</h2><p data-field=\"subtitle\">sub</p></section>\n```\n```css\n.hero { padding: 4rem; }\n```";
const FOOTER_REPLY: &str = "```html\n<footer><p data-field=\"fineprint\">(c) Acme</p></footer>\n```\n```css\nfooter { color: gray; }\n```";
const IMAGE_FIELD_REPLY: &str = "```html\n<header><h1 data-field=\"title\">T</h1><img data-field=\"logo\" src=\"l.png\" alt=\"logo\"/></header>\n```\n```css\nheader { display: flex; }\n```";

const FOUR_REGION_DESIGN: &[u8] = b"<header><h1>Acme</h1></header>\
                                    <nav><a href=\"/\">Home</a></nav>\
                                    <section class=\"hero\"><h2>Big claim</h2></section>\
                                    <footer><p>(c) Acme</p></footer>";

fn response(content: &str) -> BackendResponse {
    BackendResponse {
        content: content.to_string(),
        model: "fake-model".to_string(),
        usage: TokenUsage {
            prompt_tokens: 50,
            completion_tokens: 120,
            total_tokens: 170,
        },
    }
}

/// Replies keyed by section type, so parallel section workers stay
/// deterministic regardless of completion order.
struct TypeKeyedBackend {
    replies: HashMap<String, String>,
}

impl TypeKeyedBackend {
    fn canonical() -> Self {
        let mut replies = HashMap::new();
        replies.insert("header".to_string(), HEADER_REPLY.to_string());
        replies.insert("navigation".to_string(), NAV_REPLY.to_string());
        replies.insert("hero".to_string(), HERO_REPLY.to_string());
        replies.insert("content".to_string(), HERO_REPLY.to_string());
        replies.insert("footer".to_string(), FOOTER_REPLY.to_string());
        Self { replies }
    }
}

#[async_trait]
impl GenerativeBackend for TypeKeyedBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<BackendResponse, PipelineError> {
        let section_type = request.context["section_type"]
            .as_str()
            .unwrap_or("content")
            .to_string();
        let reply = self
            .replies
            .get(&section_type)
            .cloned()
            .unwrap_or_else(|| HERO_REPLY.to_string());
        Ok(response(&reply))
    }

    fn backend_name(&self) -> &str {
        "type-keyed"
    }

    fn model_name(&self) -> &str {
        "fake-model"
    }
}

/// Fails the first `failures` calls with a transient error, then succeeds.
struct FlakyBackend {
    failures: AtomicUsize,
    reply: String,
}

#[async_trait]
impl GenerativeBackend for FlakyBackend {
    async fn generate(&self, _request: GenerateRequest) -> Result<BackendResponse, PipelineError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PipelineError::BackendRateLimit("429".to_string()));
        }
        Ok(response(&self.reply))
    }

    fn backend_name(&self) -> &str {
        "flaky"
    }

    fn model_name(&self) -> &str {
        "fake-model"
    }
}

/// Cancels its own run through the tracker on the first backend call.
struct CancellingBackend {
    tracker: Arc<ProgressTracker>,
    fired: Mutex<bool>,
}

#[async_trait]
impl GenerativeBackend for CancellingBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<BackendResponse, PipelineError> {
        let mut fired = self.fired.lock();
        if !*fired {
            *fired = true;
            if let Some(run_id) = request.context["run_id"].as_str() {
                self.tracker.cancel(run_id);
            }
        }
        Ok(response(HEADER_REPLY))
    }

    fn backend_name(&self) -> &str {
        "cancelling"
    }

    fn model_name(&self) -> &str {
        "fake-model"
    }
}

fn executor_with(
    backend: Arc<dyn GenerativeBackend>,
    schema: FieldSchema,
    config: PipelineConfig,
) -> PipelineExecutor {
    PipelineExecutor::new(
        backend,
        schema,
        Arc::new(ProgressTracker::new()),
        Arc::new(ErrorRecoverySystem::new()),
        config,
    )
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        backoff_multiplier: 2.0,
    }
}

#[tokio::test]
async fn phase_names_and_order_are_fixed_across_runs() -> anyhow::Result<()> {
    let executor = executor_with(
        Arc::new(TypeKeyedBackend::canonical()),
        FieldSchema::default(),
        PipelineConfig::default(),
    );

    let first = executor
        .execute(FOUR_REGION_DESIGN, "design.html", "text/html")
        .await?;
    let second = executor
        .execute(FOUR_REGION_DESIGN, "design.html", "text/html")
        .await?;

    assert_eq!(first.phases.len(), 5);
    assert_eq!(second.phases.len(), 5);
    let first_names: Vec<&str> = first.phases.iter().map(|p| p.name.as_str()).collect();
    let second_names: Vec<&str> = second.phases.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(first_names, second_names);
    assert_eq!(
        first_names,
        vec![
            "Section Detection",
            "AI Generation",
            "Quality Verification",
            "Template Mapping",
            "Final Assembly"
        ]
    );
    Ok(())
}

#[tokio::test]
async fn full_run_assembles_deduplicated_package_in_detection_order() {
    let executor = executor_with(
        Arc::new(TypeKeyedBackend::canonical()),
        FieldSchema::default(),
        PipelineConfig::default(),
    );

    let run = executor
        .execute(FOUR_REGION_DESIGN, "design.html", "text/html")
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.sections.len(), 4);

    let package = run.package.unwrap();
    // Detection order: header markup before footer markup.
    let header_pos = package.html.find("<header>").unwrap();
    let footer_pos = package.html.find("<footer>").unwrap();
    assert!(header_pos < footer_pos);

    // "title" is declared by both the header and hero replies; the manifest
    // keeps exactly one entry.
    let titles = package
        .field_manifest
        .iter()
        .filter(|f| f.id == "title")
        .count();
    assert_eq!(titles, 1);

    assert!(package.aggregate_quality_score > 0.0);
    assert!(package.schema_compatibility.compatible);
}

#[tokio::test]
async fn zero_section_input_fails_identically_every_time() {
    let executor = executor_with(
        Arc::new(TypeKeyedBackend::canonical()),
        FieldSchema::default(),
        PipelineConfig::default(),
    );

    for _ in 0..2 {
        let run = executor
            .execute(b"  \n  ", "blank.html", "text/html")
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure.as_ref().unwrap().kind, ErrorKind::NoSectionsDetected);
        assert!(run.sections.is_empty());
    }
}

#[tokio::test]
async fn cancellation_between_phases_skips_the_rest() {
    let tracker = Arc::new(ProgressTracker::new());
    let backend = Arc::new(CancellingBackend {
        tracker: tracker.clone(),
        fired: Mutex::new(false),
    });
    let executor = PipelineExecutor::new(
        backend,
        FieldSchema::default(),
        tracker,
        Arc::new(ErrorRecoverySystem::new()),
        PipelineConfig::default(),
    );

    // The backend cancels the run during AI Generation; the gate is met on
    // the first candidate so the phase still completes, and the cancellation
    // lands between phase 1 and phase 2.
    let run = executor
        .execute(b"<header><h1>T</h1></header>", "design.html", "text/html")
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.cancel_requested);
    assert_eq!(run.phases[0].status, PhaseStatus::Completed);
    assert_eq!(run.phases[1].status, PhaseStatus::Completed);
    for record in &run.phases[2..] {
        assert_eq!(record.status, PhaseStatus::Skipped);
    }
}

#[tokio::test]
async fn transient_failures_recover_within_retry_budget() {
    let backend = Arc::new(FlakyBackend {
        failures: AtomicUsize::new(1),
        reply: HEADER_REPLY.to_string(),
    });
    let recovery = Arc::new(ErrorRecoverySystem::new());
    let mut config = PipelineConfig::default();
    config.retry = fast_retry();
    let executor = PipelineExecutor::new(
        backend,
        FieldSchema::default(),
        Arc::new(ProgressTracker::new()),
        recovery.clone(),
        config,
    );

    let run = executor
        .execute(b"<header><h1>T</h1></header>", "design.html", "text/html")
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let stats = recovery.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.resolved, 1);
    assert!(stats.recovery_rate > 0.99);
}

#[tokio::test]
async fn exhausted_retries_fail_the_run_with_retryable_flag() {
    let backend = Arc::new(FlakyBackend {
        failures: AtomicUsize::new(usize::MAX),
        reply: HEADER_REPLY.to_string(),
    });
    let mut config = PipelineConfig::default();
    config.retry = fast_retry();
    let executor = executor_with(backend, FieldSchema::default(), config);

    let run = executor
        .execute(b"<header><h1>T</h1></header>", "design.html", "text/html")
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let failure = run.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::BackendRateLimit);
    assert!(failure.retryable);
    assert!(!failure.suggestion.is_empty());
    assert_eq!(run.phases[1].status, PhaseStatus::Failed);
    for record in &run.phases[2..] {
        assert_eq!(record.status, PhaseStatus::Skipped);
    }
}

#[tokio::test]
async fn schema_incompatibility_fails_final_assembly_but_keeps_sections() {
    // Vocabulary without "image": the generated logo field cannot map.
    let schema = FieldSchema::new(
        "restricted.1",
        vec!["text".to_string()],
        vec!["LANDING_PAGE".to_string()],
    );
    let mut replies = HashMap::new();
    replies.insert("header".to_string(), IMAGE_FIELD_REPLY.to_string());
    let executor = executor_with(
        Arc::new(TypeKeyedBackend { replies }),
        schema,
        PipelineConfig::default(),
    );

    let run = executor
        .execute(b"<header><h1>T</h1></header>", "design.html", "text/html")
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::SchemaIncompatible);
    assert_eq!(run.phases[4].status, PhaseStatus::Failed);
    // Template mapping annotated the incompatibility without aborting.
    assert_eq!(run.phases[3].status, PhaseStatus::Completed);
    assert!(run.metadata.contains_key("template_mapping_issues"));
    // Completed section data and the assembled package stay queryable.
    assert!(!run.sections.is_empty());
    let package = run.package.as_ref().unwrap();
    assert!(!package.schema_compatibility.compatible);
    assert!(package
        .schema_compatibility
        .issues
        .iter()
        .any(|i| i.contains("image")));
}

#[tokio::test]
async fn concurrent_runs_stay_isolated() {
    let tracker = Arc::new(ProgressTracker::new());
    let executor = Arc::new(PipelineExecutor::new(
        Arc::new(TypeKeyedBackend::canonical()),
        FieldSchema::default(),
        tracker.clone(),
        Arc::new(ErrorRecoverySystem::new()),
        PipelineConfig::default(),
    ));

    let a = {
        let executor = executor.clone();
        tokio::spawn(async move {
            executor
                .execute(FOUR_REGION_DESIGN, "a.html", "text/html")
                .await
                .unwrap()
        })
    };
    let b = {
        let executor = executor.clone();
        tokio::spawn(async move {
            executor
                .execute(FOUR_REGION_DESIGN, "b.html", "text/html")
                .await
                .unwrap()
        })
    };

    let (run_a, run_b) = (a.await.unwrap(), b.await.unwrap());
    assert_ne!(run_a.run_id, run_b.run_id);
    assert_eq!(run_a.status, RunStatus::Completed);
    assert_eq!(run_b.status, RunStatus::Completed);

    let events_a = tracker.events(&run_a.run_id);
    assert!(events_a.iter().all(|e| e.run == run_a.run_id));
    assert!(tracker.get(&run_a.run_id).is_some());
    assert!(tracker.get(&run_b.run_id).is_some());
}

#[tokio::test]
async fn image_upload_flows_through_scaffold_sections() {
    let executor = executor_with(
        Arc::new(TypeKeyedBackend::canonical()),
        FieldSchema::default(),
        PipelineConfig::default(),
    );

    let run = executor
        .execute(&[0u8; 2048], "mockup.png", "image/png")
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    // Canonical scaffold: header, hero, content, footer.
    assert_eq!(run.sections.len(), 4);
    assert!(run.sections.iter().all(|s| !s.html.is_empty()));
    assert!(run.sections.iter().all(|s| s.bounding_box.is_some()));
    assert!(run
        .sections
        .iter()
        .all(|s| s.detection_confidence <= 0.95));
}

#[test]
fn landing_page_module_scenario() {
    // A minimal module declaring one text field and the LANDING_PAGE content
    // type validates against a schema carrying both, and its template scores
    // above the quality gate.
    let schema = FieldSchema::new(
        "2024.1",
        vec!["text".to_string()],
        vec!["LANDING_PAGE".to_string()],
    );
    let module: ModuleDescriptor = serde_json::from_value(json!({
        "label": "Test",
        "fields": [
            { "id": "headline", "name": "headline", "field_type": "text", "required": true }
        ],
        "content_types": ["LANDING_PAGE"],
    }))
    .unwrap();

    let verdict = SchemaValidator::check(&module, &schema);
    assert!(verdict.compatible);
    assert!(verdict.issues.is_empty());

    let report = QualityScorer::new().score("<div><h1>{{headline}}</h1></div>", "");
    assert!(report.composite > 80.0, "composite {}", report.composite);
}
