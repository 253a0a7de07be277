//! Section and module domain model.
//!
//! A Section is one logical region of the generated module (header, hero,
//! footer, ...) carrying its own markup, styles and editable fields. Sections
//! are produced by the splitter, mutated only by their own refinement loop,
//! and frozen once the assembler consumes them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum detection confidence the splitter will ever assign.
pub const MAX_DETECTION_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    Header,
    Navigation,
    Hero,
    Content,
    Sidebar,
    Footer,
    Unknown,
}

impl SectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SectionType::Header => "header",
            SectionType::Navigation => "navigation",
            SectionType::Hero => "hero",
            SectionType::Content => "content",
            SectionType::Sidebar => "sidebar",
            SectionType::Footer => "footer",
            SectionType::Unknown => "unknown",
        }
    }

    /// Types whose placement in a layout is structurally unambiguous.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            SectionType::Header | SectionType::Hero | SectionType::Footer
        )
    }
}

/// Region geometry in design coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    RichText,
    Image,
    Url,
    Boolean,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::RichText => "richtext",
            FieldType::Image => "image",
            FieldType::Url => "url",
            FieldType::Boolean => "boolean",
        }
    }
}

/// A named, typed insertion point within a section's markup that a downstream
/// editor can bind content to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditableField {
    pub id: String,
    pub name: String,
    pub field_type: FieldType,
    /// CSS selector locating the bound element within the section markup.
    pub selector: String,
    pub default_value: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub section_type: SectionType,
    pub bounding_box: Option<BoundingBox>,
    pub html: String,
    pub css: String,
    pub editable_fields: Vec<EditableField>,
    /// Composite quality score, 0-100.
    pub quality_score: f64,
    /// Splitter confidence, 0-0.95.
    pub detection_confidence: f64,
}

impl Section {
    pub fn new(id: String, section_type: SectionType) -> Self {
        Self {
            id,
            section_type,
            bounding_box: None,
            html: String::new(),
            css: String::new(),
            editable_fields: Vec::new(),
            quality_score: 0.0,
            detection_confidence: 0.0,
        }
    }

    /// Field ids must be unique within a section; duplicates are collapsed
    /// keeping the first occurrence.
    pub fn dedupe_fields(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.editable_fields.retain(|f| seen.insert(f.id.clone()));
    }
}

/// One generate+score attempt within a section's refinement history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationAttempt {
    pub section_id: String,
    pub iteration: usize,
    pub prompt_digest: String,
    pub candidate_html: String,
    pub candidate_css: String,
    pub score: f64,
    pub timestamp_ms: u64,
    pub model: String,
    pub token_usage: TokenUsage,
}

/// Token accounting reported by the generative backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Per-dimension quality scores, each 0-100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub html_validity: f64,
    pub accessibility: f64,
    pub framework_optimization: f64,
    pub editability: f64,
    pub platform_compliance: f64,
}

/// Quality verdict for one candidate. Errors and warnings degrade the score
/// but never abort the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub dimensions: DimensionScores,
    pub composite: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl QualityReport {
    pub fn meets(&self, threshold: f64) -> bool {
        self.composite >= threshold
    }
}

/// Before/after summary attached to a refinement outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityImprovement {
    pub before: f64,
    pub after: f64,
    pub improvement: f64,
}

/// The assembled, deduplicated output of the pipeline, ready for external
/// packaging/export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulePackage {
    pub sections: Vec<Section>,
    pub html: String,
    pub css: String,
    pub field_manifest: Vec<EditableField>,
    pub aggregate_quality_score: f64,
    pub schema_compatibility: crate::schema::SchemaCompatibility,
    pub metadata: HashMap<String, String>,
}
