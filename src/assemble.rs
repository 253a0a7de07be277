//! Module assembly.
//!
//! Merges refined sections into a single module package: markup concatenated
//! in detection order, editable fields deduplicated by id (first occurrence
//! wins), aggregate score weighted by section complexity. Serialization to a
//! distributable archive is a collaborator concern; nothing here touches the
//! filesystem.

use crate::schema::SchemaCompatibility;
use crate::section::{EditableField, ModulePackage, Section};
use std::collections::HashMap;
use std::collections::HashSet;
use tracing::debug;

pub struct Assembler;

impl Assembler {
    /// Assemble refined sections into a module package.
    ///
    /// `sections` must already be in detection order; the assembler preserves
    /// it. Sections are frozen from this point on.
    pub fn assemble(
        sections: Vec<Section>,
        schema_compatibility: SchemaCompatibility,
        metadata: HashMap<String, String>,
    ) -> ModulePackage {
        let html = sections
            .iter()
            .map(|s| s.html.as_str())
            .filter(|h| !h.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let css = sections
            .iter()
            .map(|s| s.css.as_str())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let field_manifest = dedupe_fields(&sections);
        let aggregate_quality_score = aggregate_score(&sections);

        debug!(
            section_count = sections.len(),
            field_count = field_manifest.len(),
            aggregate_quality_score,
            schema_compatible = schema_compatibility.compatible,
            "module assembled"
        );

        ModulePackage {
            sections,
            html,
            css,
            field_manifest,
            aggregate_quality_score,
            schema_compatibility,
            metadata,
        }
    }
}

/// First occurrence wins, scanning sections in detection order.
fn dedupe_fields(sections: &[Section]) -> Vec<EditableField> {
    let mut seen = HashSet::new();
    let mut manifest = Vec::new();
    for section in sections {
        for field in &section.editable_fields {
            if seen.insert(field.id.clone()) {
                manifest.push(field.clone());
            }
        }
    }
    manifest
}

/// Complexity-weighted average of section scores: sections with more editable
/// fields weigh more (weight = 1 + field count).
pub fn aggregate_score(sections: &[Section]) -> f64 {
    if sections.is_empty() {
        return 0.0;
    }
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for section in sections {
        let weight = 1.0 + section.editable_fields.len() as f64;
        weighted_sum += section.quality_score * weight;
        weight_total += weight;
    }
    weighted_sum / weight_total
}
