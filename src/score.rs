//! Quality scoring.
//!
//! Five pure dimension checks over a candidate's markup and styles, combined
//! into a weighted composite. Scoring is deterministic for a given candidate:
//! no randomness, no I/O, so repeated calls are bit-identical and the score
//! can gate refinement.

use crate::section::{DimensionScores, QualityReport};
use crate::split::fields_from_markup;

/// Composite weights, fixed once for the whole system.
pub const WEIGHT_HTML_VALIDITY: f64 = 0.30;
pub const WEIGHT_ACCESSIBILITY: f64 = 0.25;
pub const WEIGHT_FRAMEWORK: f64 = 0.20;
pub const WEIGHT_EDITABILITY: f64 = 0.15;
pub const WEIGHT_PLATFORM: f64 = 0.10;

/// Tags whose open/close balance is checked.
const BALANCED_TAGS: [&str; 16] = [
    "div", "section", "header", "footer", "nav", "aside", "span", "p", "a", "ul", "ol", "li",
    "form", "button", "article", "main",
];

const DEPRECATED_TAGS: [&str; 3] = ["font", "center", "marquee"];

pub struct QualityScorer;

impl QualityScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score one candidate. Pure function of (html, css).
    pub fn score(&self, html: &str, css: &str) -> QualityReport {
        let mut report = QualityReport::default();
        let lower = html.to_ascii_lowercase();

        let dimensions = DimensionScores {
            html_validity: score_html_validity(&lower, &mut report),
            accessibility: score_accessibility(&lower, &mut report),
            framework_optimization: score_framework(&lower, css, &mut report),
            editability: score_editability(html, &mut report),
            platform_compliance: score_platform(&lower, &mut report),
        };

        let composite = WEIGHT_HTML_VALIDITY * dimensions.html_validity
            + WEIGHT_ACCESSIBILITY * dimensions.accessibility
            + WEIGHT_FRAMEWORK * dimensions.framework_optimization
            + WEIGHT_EDITABILITY * dimensions.editability
            + WEIGHT_PLATFORM * dimensions.platform_compliance;

        report.dimensions = dimensions;
        report.composite = composite.clamp(0.0, 100.0);
        report
    }
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new()
    }
}

fn score_html_validity(lower: &str, report: &mut QualityReport) -> f64 {
    if lower.trim().is_empty() {
        report.errors.push("section markup is empty".to_string());
        return 0.0;
    }

    let mut score: f64 = 100.0;
    for tag in BALANCED_TAGS {
        let opens = count_tag_opens(lower, tag);
        let closes = count_occurrences(lower, &format!("</{tag}>"));
        if opens != closes {
            score -= 15.0;
            report.errors.push(format!("unbalanced <{tag}> tags"));
        }
    }
    for tag in DEPRECATED_TAGS {
        if count_tag_opens(lower, tag) > 0 {
            score -= 10.0;
            report.errors.push(format!("deprecated <{tag}> tag"));
        }
    }
    score.max(0.0)
}

fn score_accessibility(lower: &str, report: &mut QualityReport) -> f64 {
    let mut score: f64 = 100.0;

    let images = count_tag_opens(lower, "img");
    let images_with_alt = count_occurrences(lower, "alt=");
    if images > images_with_alt {
        let missing = images - images_with_alt;
        score -= 20.0 * missing as f64;
        report
            .errors
            .push(format!("{missing} image(s) without alt text"));
    }

    let has_heading = (1..=6).any(|level| count_tag_opens(lower, &format!("h{level}")) > 0);
    if !has_heading {
        score -= 15.0;
        report
            .warnings
            .push("no heading element in section".to_string());
        report
            .suggestions
            .push("add a heading to anchor the section hierarchy".to_string());
    }

    let anchors = count_tag_opens(lower, "a");
    let anchors_with_href = count_occurrences(lower, "href=");
    if anchors > anchors_with_href {
        score -= 10.0;
        report
            .warnings
            .push("anchor element without href".to_string());
    }

    if count_tag_opens(lower, "input") > 0
        && !lower.contains("aria-label")
        && count_tag_opens(lower, "label") == 0
    {
        score -= 10.0;
        report
            .warnings
            .push("form inputs without labels".to_string());
    }

    score.max(0.0)
}

fn score_framework(lower: &str, css: &str, report: &mut QualityReport) -> f64 {
    let mut score: f64 = 100.0;

    let inline_styles = count_occurrences(lower, "style=");
    if inline_styles > 0 {
        score -= (10.0 * inline_styles as f64).min(40.0);
        report
            .warnings
            .push(format!("{inline_styles} inline style attribute(s)"));
        report
            .suggestions
            .push("move inline styles into the section stylesheet".to_string());
    }

    if css.contains("!important") {
        score -= 10.0;
        report
            .warnings
            .push("stylesheet relies on !important".to_string());
    }

    if css.trim().is_empty() && lower.len() > 120 {
        score -= 20.0;
        report
            .warnings
            .push("substantial markup with no stylesheet".to_string());
    }

    score.max(0.0)
}

fn score_editability(html: &str, report: &mut QualityReport) -> f64 {
    let fields = fields_from_markup(html);
    if fields.is_empty() {
        report
            .errors
            .push("no editable fields declared (data-field)".to_string());
        report
            .suggestions
            .push("mark editable insertion points with data-field attributes".to_string());
        return 20.0;
    }

    // Duplicate markers collapse downstream; surface them here.
    let marker_count = count_occurrences(&html.to_ascii_lowercase(), "data-field=\"");
    let mut score = (60.0 + 10.0 * fields.len() as f64).min(100.0);
    if marker_count > fields.len() {
        score -= 20.0;
        report
            .errors
            .push("duplicate data-field ids within section".to_string());
    }
    score.max(0.0)
}

fn score_platform(lower: &str, report: &mut QualityReport) -> f64 {
    let mut score: f64 = 100.0;

    if count_tag_opens(lower, "script") > 0 {
        score -= 50.0;
        report
            .errors
            .push("script tags are not allowed in modules".to_string());
    }
    if count_tag_opens(lower, "iframe") > 0 {
        score -= 30.0;
        report
            .errors
            .push("iframe embeds are not allowed in modules".to_string());
    }
    for handler in ["onclick=", "onload=", "onerror=", "onmouseover="] {
        if lower.contains(handler) {
            score -= 20.0;
            report
                .errors
                .push(format!("inline event handler {handler} is not allowed"));
        }
    }
    if lower.len() > 50_000 {
        score -= 20.0;
        report
            .warnings
            .push("section markup exceeds 50k characters".to_string());
    }

    score.max(0.0)
}

/// Count `<tag` openings followed by a boundary character, so `<header` does
/// not match `<h1` and `<a` does not match `<article`.
fn count_tag_opens(lower: &str, tag: &str) -> usize {
    let needle = format!("<{tag}");
    let mut count = 0usize;
    let mut cursor = 0usize;
    while let Some(rel) = lower[cursor..].find(&needle) {
        let after = cursor + rel + needle.len();
        match lower[after..].chars().next() {
            Some('>') | Some(' ') | Some('\t') | Some('\n') | Some('/') => count += 1,
            _ => {}
        }
        cursor = after;
    }
    count
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    let mut count = 0usize;
    let mut cursor = 0usize;
    while let Some(rel) = haystack[cursor..].find(needle) {
        count += 1;
        cursor += rel + needle.len();
    }
    count
}
