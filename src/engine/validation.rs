//! Per-collection validation hooks. A schema rule names required fields and
//! expected field kinds; `strict` mode rejects a violating document, while
//! `warning` mode records the violations and accepts the write.

use std::collections::HashMap;

use dashmap::DashMap;
use serde_json::Value;
use tracing::warn;

use crate::document::Document;
use crate::errors::{ChronError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    #[default]
    Strict,
    Warning,
}

/// Expected JSON kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }
}

/// Schema rule for one collection.
#[derive(Debug, Clone, Default)]
pub struct SchemaRule {
    pub mode: ValidationMode,
    pub required: Vec<String>,
    pub kinds: HashMap<String, FieldKind>,
}

impl SchemaRule {
    fn violations(&self, doc: &Document) -> Vec<String> {
        let mut violations = Vec::new();
        for field in &self.required {
            if doc.get(field).is_none() {
                violations.push(format!("{field}: required field is missing"));
            }
        }
        for (field, kind) in &self.kinds {
            if let Some(value) = doc.get(field)
                && !value.is_null()
                && !kind.matches(value)
            {
                violations.push(format!("{field}: expected {kind:?}"));
            }
        }
        violations.sort();
        violations
    }
}

/// Registered rules, keyed by collection name.
#[derive(Debug, Default)]
pub struct ValidationRegistry {
    rules: DashMap<String, SchemaRule>,
}

impl ValidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, table: impl Into<String>, rule: SchemaRule) {
        self.rules.insert(table.into(), rule);
    }

    /// Validate a document against its collection's rule, if one is
    /// registered. Returns the violations that were tolerated (warning
    /// mode); strict-mode violations fail the write.
    pub fn validate(&self, doc: &Document) -> Result<Vec<String>> {
        let table = doc.table()?;
        let Some(rule) = self.rules.get(&table) else {
            return Ok(Vec::new());
        };
        let violations = rule.violations(doc);
        if violations.is_empty() {
            return Ok(Vec::new());
        }
        match rule.mode {
            ValidationMode::Strict => Err(ChronError::Validation {
                document_id: doc.id()?.to_string(),
                violations,
            }),
            ValidationMode::Warning => {
                warn!(
                    document = doc.id()?,
                    table, ?violations, "document accepted with schema violations"
                );
                Ok(violations)
            }
        }
    }
}
