//! Section detection.
//!
//! Turns a normalized design input into an ordered list of candidate
//! sections with type and geometry. HTML fragments are scanned for semantic
//! regions in document order; image inputs (no local geometry extraction)
//! yield the canonical scaffold of candidate regions for downstream
//! generation. Detection is deterministic and pure.

use crate::input::{DesignInput, InputKind};
use crate::section::{
    BoundingBox, EditableField, FieldType, Section, SectionType, MAX_DETECTION_CONFIDENCE,
};
use crate::types::new_section_id;
use tracing::debug;

/// Design canvas assumed when explicit geometry is unavailable.
const CANVAS_WIDTH: f64 = 1440.0;

/// Semantic tags recognized by the fragment scanner, in match priority.
const REGION_TAGS: [(&str, SectionType); 5] = [
    ("header", SectionType::Header),
    ("nav", SectionType::Navigation),
    ("section", SectionType::Content),
    ("aside", SectionType::Sidebar),
    ("footer", SectionType::Footer),
];

pub struct SectionSplitter;

impl SectionSplitter {
    pub fn new() -> Self {
        Self
    }

    /// Produce ordered candidate sections for a design input.
    ///
    /// An empty result is meaningful: the executor turns it into the
    /// deterministic `NoSectionsDetected` failure rather than an empty
    /// success.
    pub fn split(&self, input: &DesignInput) -> Vec<Section> {
        let sections = match (&input.kind, &input.html) {
            (InputKind::Html, Some(html)) => self.split_fragment(html),
            _ => self.image_scaffold(),
        };
        debug!(
            filename = %input.filename,
            section_count = sections.len(),
            "section detection finished"
        );
        sections
    }

    /// Scan an HTML fragment for semantic regions in document order.
    fn split_fragment(&self, html: &str) -> Vec<Section> {
        let mut sections = Vec::new();
        for (section_type, markup) in scan_regions(html) {
            sections.push(self.build_section(section_type, markup));
        }

        if sections.is_empty() && has_renderable_content(html) {
            // Renderable content with no recognizable region still maps to a
            // single content section.
            sections.push(self.build_section(SectionType::Content, html.to_string()));
        }

        sections
    }

    /// Canonical candidate regions for inputs without extractable geometry.
    fn image_scaffold(&self) -> Vec<Section> {
        [
            SectionType::Header,
            SectionType::Hero,
            SectionType::Content,
            SectionType::Footer,
        ]
        .into_iter()
        .map(|ty| self.build_section(ty, String::new()))
        .collect()
    }

    fn build_section(&self, section_type: SectionType, html: String) -> Section {
        let mut section = Section::new(new_section_id(), section_type);
        section.editable_fields = fields_from_markup(&html);
        section.bounding_box = Some(default_bounding_box(section_type));
        section.html = html;
        section.detection_confidence = detection_confidence(&section);
        section
    }
}

impl Default for SectionSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed per-type geometry used when the design carries no explicit boxes.
pub fn default_bounding_box(section_type: SectionType) -> BoundingBox {
    match section_type {
        SectionType::Header => BoundingBox {
            x: 0.0,
            y: 0.0,
            width: CANVAS_WIDTH,
            height: 120.0,
        },
        SectionType::Navigation => BoundingBox {
            x: 0.0,
            y: 120.0,
            width: CANVAS_WIDTH,
            height: 60.0,
        },
        SectionType::Hero => BoundingBox {
            x: 0.0,
            y: 180.0,
            width: CANVAS_WIDTH,
            height: 480.0,
        },
        SectionType::Content | SectionType::Unknown => BoundingBox {
            x: 0.0,
            y: 660.0,
            width: 1000.0,
            height: 600.0,
        },
        SectionType::Sidebar => BoundingBox {
            x: 1000.0,
            y: 660.0,
            width: CANVAS_WIDTH - 1000.0,
            height: 600.0,
        },
        SectionType::Footer => BoundingBox {
            x: 0.0,
            y: 1260.0,
            width: CANVAS_WIDTH,
            height: 160.0,
        },
    }
}

/// Detection confidence: 0.7 base, +0.1 for editable fields, +0.1 for
/// structural types, +0.05 for substantial markup, capped at 0.95.
pub fn detection_confidence(section: &Section) -> f64 {
    let mut confidence: f64 = 0.7;
    if !section.editable_fields.is_empty() {
        confidence += 0.1;
    }
    if section.section_type.is_structural() {
        confidence += 0.1;
    }
    if section.html.len() > 100 {
        confidence += 0.05;
    }
    confidence.min(MAX_DETECTION_CONFIDENCE)
}

/// Ordered (type, markup) regions found in a fragment. Nested regions of the
/// same tag are not unwound; the scan is a heuristic over fragments, not a
/// full parser.
fn scan_regions(html: &str) -> Vec<(SectionType, String)> {
    let lower = html.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut regions = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let rest = &lower[i..];
        let mut matched = None;
        for (tag, section_type) in REGION_TAGS {
            if let Some(after) = rest.strip_prefix('<').and_then(|r| r.strip_prefix(tag)) {
                let boundary = after.chars().next();
                if matches!(boundary, Some('>') | Some(' ') | Some('\t') | Some('\n')) {
                    matched = Some((tag, section_type));
                    break;
                }
            }
        }

        let Some((tag, mut section_type)) = matched else {
            i += 1;
            continue;
        };

        let close = format!("</{tag}>");
        let Some(close_rel) = lower[i..].find(&close) else {
            i += 1;
            continue;
        };
        let end = i + close_rel + close.len();
        let markup = html[i..end].to_string();

        // A <section> whose opening tag advertises a hero block is a hero.
        if section_type == SectionType::Content {
            let open_end = lower[i..end].find('>').map(|p| i + p).unwrap_or(end);
            if lower[i..open_end].contains("hero") {
                section_type = SectionType::Hero;
            }
        }

        regions.push((section_type, markup));
        i = end;
    }

    regions
}

/// Whether a fragment has anything worth generating from: visible text or at
/// least one element.
fn has_renderable_content(html: &str) -> bool {
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag && !c.is_whitespace() => return true,
            _ => {}
        }
    }
    false
}

/// Extract editable fields declared via `data-field` markers.
pub fn fields_from_markup(html: &str) -> Vec<EditableField> {
    const MARKER: &str = "data-field=\"";
    let lower = html.to_ascii_lowercase();
    let mut fields: Vec<EditableField> = Vec::new();
    let mut cursor = 0usize;

    while let Some(rel) = lower[cursor..].find(MARKER) {
        let name_start = cursor + rel + MARKER.len();
        let Some(name_len) = lower[name_start..].find('"') else {
            break;
        };
        let name = html[name_start..name_start + name_len].to_string();
        let tag = enclosing_tag(&lower, cursor + rel);
        let field_type = infer_field_type(&tag);
        if !name.is_empty() && !fields.iter().any(|f| f.id == name) {
            fields.push(EditableField {
                id: name.clone(),
                name,
                field_type,
                selector: format!("[data-field=\"{}\"]", &html[name_start..name_start + name_len]),
                default_value: String::new(),
                required: false,
            });
        }
        cursor = name_start + name_len;
    }

    fields
}

/// Tag name of the element whose attribute list contains byte offset `pos`.
fn enclosing_tag(lower: &str, pos: usize) -> String {
    let open = lower[..pos].rfind('<').map(|p| p + 1).unwrap_or(0);
    lower[open..pos]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn infer_field_type(tag: &str) -> FieldType {
    match tag {
        "img" => FieldType::Image,
        "a" => FieldType::Url,
        "p" | "div" | "article" | "blockquote" => FieldType::RichText,
        _ => FieldType::Text,
    }
}
