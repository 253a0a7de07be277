//! Schema compatibility checking.
//!
//! The schema is an externally supplied, versioned vocabulary of valid field
//! and content types; it is swappable without code changes. `check` is a pure
//! function of (module, schema) — no network, no clock.

use crate::section::EditableField;
use serde::{Deserialize, Serialize};

/// Externally versioned vocabulary consumed by the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub version: String,
    pub valid_field_types: Vec<String>,
    pub valid_content_types: Vec<String>,
}

impl FieldSchema {
    pub fn new(
        version: impl Into<String>,
        valid_field_types: Vec<String>,
        valid_content_types: Vec<String>,
    ) -> Self {
        Self {
            version: version.into(),
            valid_field_types,
            valid_content_types,
        }
    }
}

impl Default for FieldSchema {
    fn default() -> Self {
        Self {
            version: "2024.1".to_string(),
            valid_field_types: ["text", "richtext", "image", "url", "boolean"]
                .into_iter()
                .map(String::from)
                .collect(),
            valid_content_types: ["LANDING_PAGE", "SITE_PAGE", "BLOG_POST", "EMAIL"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// A field as declared by a module. Declared types are plain vocabulary
/// strings: modules arriving from outside may well declare types this crate
/// has no variant for, and the validator must name them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDeclaration {
    pub id: String,
    pub name: String,
    pub field_type: String,
    pub required: bool,
}

impl From<&EditableField> for FieldDeclaration {
    fn from(field: &EditableField) -> Self {
        Self {
            id: field.id.clone(),
            name: field.name.clone(),
            field_type: field.field_type.as_str().to_string(),
            required: field.required,
        }
    }
}

/// The module surface the validator inspects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub label: String,
    pub fields: Vec<FieldDeclaration>,
    pub content_types: Vec<String>,
}

/// Validator verdict attached to the assembled package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCompatibility {
    pub compatible: bool,
    pub schema_version: String,
    pub issues: Vec<String>,
}

pub struct SchemaValidator;

impl SchemaValidator {
    /// Cross-reference every declared field type and content type against the
    /// schema vocabulary. Any unknown value is an issue and clears
    /// `compatible`.
    pub fn check(module: &ModuleDescriptor, schema: &FieldSchema) -> SchemaCompatibility {
        let mut issues = Vec::new();

        for field in &module.fields {
            if !schema
                .valid_field_types
                .iter()
                .any(|t| t == &field.field_type)
            {
                issues.push(format!(
                    "unknown field type '{}' on field '{}'",
                    field.field_type, field.id
                ));
            }
        }

        for content_type in &module.content_types {
            if !schema
                .valid_content_types
                .iter()
                .any(|t| t == content_type)
            {
                issues.push(format!("unknown content type '{content_type}'"));
            }
        }

        SchemaCompatibility {
            compatible: issues.is_empty(),
            schema_version: schema.version.clone(),
            issues,
        }
    }
}
