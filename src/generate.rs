//! Content generation for a single section.
//!
//! Builds the backend prompt from section context (and, on refinement calls,
//! a delta description of what must improve), invokes the generative backend,
//! and normalizes the raw reply into an HTML/CSS candidate. This is the only
//! place the backend is called.

use crate::backend::{GenerateRequest, GenerativeBackend};
use crate::error::PipelineError;
use crate::section::{GenerationAttempt, QualityReport, Section};
use crate::types::now_millis;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Run-scoped context shipped with every generation call.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub run_id: String,
    pub source_name: String,
}

pub struct ContentGenerator {
    backend: Arc<dyn GenerativeBackend>,
}

impl ContentGenerator {
    pub fn new(backend: Arc<dyn GenerativeBackend>) -> Self {
        Self { backend }
    }

    /// Produce a candidate for one section.
    ///
    /// `prior` carries the previous iteration's report; when present the
    /// prompt asks for targeted improvement instead of a fresh draft.
    pub async fn generate(
        &self,
        section: &Section,
        context: &GenerationContext,
        iteration: usize,
        prior: Option<(&GenerationAttempt, &QualityReport)>,
    ) -> Result<GenerationAttempt, PipelineError> {
        let prompt = match prior {
            Some((attempt, report)) => refinement_prompt(section, attempt, report),
            None => initial_prompt(section),
        };
        let prompt_digest = hex::encode(blake3::hash(prompt.as_bytes()).as_bytes());

        let request = GenerateRequest {
            prompt,
            context: json!({
                "run_id": context.run_id,
                "source": context.source_name,
                "section_id": section.id,
                "section_type": section.section_type.as_str(),
                "bounding_box": section.bounding_box,
                "iteration": iteration,
            }),
        };

        let start = Instant::now();
        let response = self.backend.generate(request).await?;
        debug!(
            run_id = %context.run_id,
            section_id = %section.id,
            iteration,
            model = %response.model,
            duration_ms = start.elapsed().as_millis() as u64,
            total_tokens = response.usage.total_tokens,
            "backend reply received"
        );

        let (candidate_html, candidate_css) = normalize_candidate(&response.content)
            .ok_or_else(|| {
                warn!(
                    run_id = %context.run_id,
                    section_id = %section.id,
                    iteration,
                    "backend reply contained no usable markup"
                );
                PipelineError::GenerationFatal(format!(
                    "no usable markup in backend reply for section {}",
                    section.id
                ))
            })?;

        Ok(GenerationAttempt {
            section_id: section.id.clone(),
            iteration,
            prompt_digest,
            candidate_html,
            candidate_css,
            score: 0.0,
            timestamp_ms: now_millis(),
            model: response.model,
            token_usage: response.usage,
        })
    }
}

fn initial_prompt(section: &Section) -> String {
    let mut prompt = format!(
        "Produce production-quality HTML and CSS for the {} region of a UI module.\n",
        section.section_type.as_str()
    );
    if let Some(bbox) = &section.bounding_box {
        prompt.push_str(&format!(
            "Target geometry: {}x{} at ({}, {}).\n",
            bbox.width, bbox.height, bbox.x, bbox.y
        ));
    }
    if !section.html.is_empty() {
        prompt.push_str("Source markup to rework:\n");
        prompt.push_str(&section.html);
        prompt.push('\n');
    }
    if !section.editable_fields.is_empty() {
        prompt.push_str("Preserve these editable fields (data-field attributes):\n");
        for field in &section.editable_fields {
            prompt.push_str(&format!(
                "- {} ({})\n",
                field.id,
                field.field_type.as_str()
            ));
        }
    }
    prompt.push_str(
        "Mark every editable insertion point with a data-field attribute. \
         Return the HTML in an ```html fence and the CSS in a ```css fence.",
    );
    prompt
}

fn refinement_prompt(
    section: &Section,
    attempt: &GenerationAttempt,
    report: &QualityReport,
) -> String {
    let mut prompt = format!(
        "Improve the previous {} candidate. Current composite quality score: {:.1}.\n",
        section.section_type.as_str(),
        report.composite
    );
    if !report.errors.is_empty() {
        prompt.push_str("Fix these errors:\n");
        for error in &report.errors {
            prompt.push_str(&format!("- {error}\n"));
        }
    }
    if !report.warnings.is_empty() {
        prompt.push_str("Address these warnings:\n");
        for warning in &report.warnings {
            prompt.push_str(&format!("- {warning}\n"));
        }
    }
    if !report.suggestions.is_empty() {
        prompt.push_str("Consider:\n");
        for suggestion in &report.suggestions {
            prompt.push_str(&format!("- {suggestion}\n"));
        }
    }
    prompt.push_str("Previous HTML:\n");
    prompt.push_str(&attempt.candidate_html);
    if !attempt.candidate_css.is_empty() {
        prompt.push_str("\nPrevious CSS:\n");
        prompt.push_str(&attempt.candidate_css);
    }
    prompt.push_str(
        "\nKeep every data-field attribute. Return the HTML in an ```html fence \
         and the CSS in a ```css fence.",
    );
    prompt
}

/// Normalize a raw backend reply into (html, css).
///
/// Accepts fenced ```html/```css blocks, inline `<style>` elements, or a bare
/// markup reply. Returns `None` when no element markup can be recovered.
pub fn normalize_candidate(content: &str) -> Option<(String, String)> {
    let fenced_html = extract_fence(content, "html");
    let fenced_css = extract_fence(content, "css");

    if let Some(html) = fenced_html {
        let css = fenced_css.unwrap_or_default();
        if looks_like_markup(&html) {
            return Some((html, css));
        }
        return None;
    }

    // No fences: peel <style> blocks out of the reply, the rest is markup.
    let (html, css) = split_style_blocks(content);
    let html = html.trim().to_string();
    if looks_like_markup(&html) {
        return Some((html, css));
    }
    None
}

fn extract_fence(content: &str, language: &str) -> Option<String> {
    let open = format!("```{language}");
    let start = content.find(&open)? + open.len();
    let rest = &content[start..];
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

fn split_style_blocks(content: &str) -> (String, String) {
    let mut html = String::new();
    let mut css = String::new();
    let mut rest = content;
    loop {
        let lower = rest.to_ascii_lowercase();
        let Some(open) = lower.find("<style") else {
            html.push_str(rest);
            break;
        };
        let Some(open_end) = lower[open..].find('>').map(|p| open + p + 1) else {
            html.push_str(rest);
            break;
        };
        let Some(close) = lower[open_end..].find("</style>").map(|p| open_end + p) else {
            html.push_str(rest);
            break;
        };
        html.push_str(&rest[..open]);
        css.push_str(rest[open_end..close].trim());
        css.push('\n');
        rest = &rest[close + "</style>".len()..];
    }
    (html, css.trim().to_string())
}

fn looks_like_markup(text: &str) -> bool {
    let open = text.find('<');
    let close = text.rfind('>');
    matches!((open, close), (Some(o), Some(c)) if o < c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::section::{Section, SectionType};

    fn context() -> GenerationContext {
        GenerationContext {
            run_id: "run-1".to_string(),
            source_name: "design.html".to_string(),
        }
    }

    #[test]
    fn normalizes_fenced_reply() {
        let reply = "Here you go:\n```html\n<div data-field=\"t\">x</div>\n```\n```css\n.t { color: red; }\n```";
        let (html, css) = normalize_candidate(reply).unwrap();
        assert_eq!(html, "<div data-field=\"t\">x</div>");
        assert_eq!(css, ".t { color: red; }");
    }

    #[test]
    fn normalizes_inline_style_reply() {
        let reply = "<style>.a { margin: 0; }</style><div class=\"a\">x</div>";
        let (html, css) = normalize_candidate(reply).unwrap();
        assert_eq!(html, "<div class=\"a\">x</div>");
        assert_eq!(css, ".a { margin: 0; }");
    }

    #[test]
    fn bare_markup_passes_through() {
        let (html, css) = normalize_candidate("<section><p>hi</p></section>").unwrap();
        assert_eq!(html, "<section><p>hi</p></section>");
        assert!(css.is_empty());
    }

    #[test]
    fn prose_reply_is_rejected() {
        assert!(normalize_candidate("I cannot produce markup for this.").is_none());
    }

    #[tokio::test]
    async fn generates_attempt_with_digest() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            "```html\n<header data-field=\"title\">T</header>\n```".to_string(),
        ]));
        let generator = ContentGenerator::new(backend);
        let section = Section::new("s1".to_string(), SectionType::Header);
        let attempt = generator
            .generate(&section, &context(), 0, None)
            .await
            .unwrap();
        assert_eq!(attempt.iteration, 0);
        assert_eq!(attempt.candidate_html, "<header data-field=\"title\">T</header>");
        assert_eq!(attempt.prompt_digest.len(), 64);
        assert_eq!(attempt.model, "scripted");
    }

    #[tokio::test]
    async fn prose_reply_is_generation_fatal() {
        let backend = Arc::new(ScriptedBackend::new(vec!["no markup here".to_string()]));
        let generator = ContentGenerator::new(backend);
        let section = Section::new("s1".to_string(), SectionType::Hero);
        let err = generator
            .generate(&section, &context(), 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::GenerationFatal(_)));
    }

    #[test]
    fn refinement_prompt_carries_report_deltas() {
        let section = Section::new("s1".to_string(), SectionType::Hero);
        let attempt = GenerationAttempt {
            section_id: "s1".to_string(),
            iteration: 0,
            prompt_digest: String::new(),
            candidate_html: "<div>old</div>".to_string(),
            candidate_css: String::new(),
            score: 55.0,
            timestamp_ms: 0,
            model: "m".to_string(),
            token_usage: Default::default(),
        };
        let report = QualityReport {
            composite: 55.0,
            errors: vec!["unbalanced <div> tags".to_string()],
            warnings: vec!["image without alt text".to_string()],
            ..Default::default()
        };
        let prompt = refinement_prompt(&section, &attempt, &report);
        assert!(prompt.contains("unbalanced <div> tags"));
        assert!(prompt.contains("image without alt text"));
        assert!(prompt.contains("<div>old</div>"));
    }
}
