//! The document model: a JSON-compatible map with a required `id` of the
//! form `collection:identifier` and an optional `_table` field naming the
//! collection explicitly. Fields beginning with `_` are reserved for the
//! engine. Serialization is canonical UTF-8 JSON with sorted keys, so the
//! same document always produces the same blob and the same object id.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ChronError, Result};

/// Collection used for bare identifiers without a `collection:` prefix.
pub const DEFAULT_TABLE: &str = "default";

/// A document key split into its collection and identifier halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentId {
    pub table: String,
    pub ident: String,
}

impl DocumentId {
    /// Parse an id string. `user:1` names collection `user`; a bare `1`
    /// falls into the `default` collection. The collection half must be a
    /// non-empty identifier.
    pub fn parse(id: &str) -> Result<DocumentId> {
        if id.is_empty() {
            return Err(ChronError::NilDocument("empty id".to_string()));
        }
        match id.split_once(':') {
            Some((table, ident)) => {
                if table.is_empty() {
                    return Err(ChronError::InvalidKey(
                        id.to_string(),
                        "empty collection prefix".to_string(),
                    ));
                }
                Ok(DocumentId {
                    table: table.to_string(),
                    ident: ident.to_string(),
                })
            }
            None => Ok(DocumentId {
                table: DEFAULT_TABLE.to_string(),
                ident: id.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: Map<String, Value>,
}

impl Display for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.fields.clone()))
    }
}

impl Document {
    /// Build a document from a field map, validating the `id` field.
    pub fn new(fields: Map<String, Value>) -> Result<Document> {
        let doc = Document { fields };
        doc.id()?;
        Ok(doc)
    }

    /// Build a document from any JSON value; rejects non-objects and null.
    pub fn from_value(value: Value) -> Result<Document> {
        match value {
            Value::Object(fields) => Document::new(fields),
            Value::Null => Err(ChronError::NilDocument("null document".to_string())),
            other => Err(ChronError::NilDocument(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn from_json(text: &str) -> Result<Document> {
        Document::from_value(serde_json::from_str(text)?)
    }

    /// The required `id` field.
    pub fn id(&self) -> Result<&str> {
        match self.fields.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Ok(id),
            Some(Value::String(_)) => Err(ChronError::NilDocument("empty id".to_string())),
            Some(other) => Err(ChronError::NilDocument(format!(
                "id must be a string, got {other}"
            ))),
            None => Err(ChronError::NilDocument("missing id field".to_string())),
        }
    }

    /// Collection name: the explicit `_table` field if present, otherwise
    /// derived from the id prefix.
    pub fn table(&self) -> Result<String> {
        if let Some(Value::String(table)) = self.fields.get("_table") {
            return Ok(table.clone());
        }
        Ok(DocumentId::parse(self.id()?)?.table)
    }

    /// Return a copy with `_table` filled in; the persisted form always
    /// carries the collection explicitly.
    pub fn with_table(&self) -> Result<Document> {
        let mut fields = self.fields.clone();
        let table = self.table()?;
        fields.insert("_table".to_string(), Value::String(table));
        Ok(Document { fields })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    /// Canonical JSON bytes: UTF-8, keys in sorted order. This is the blob
    /// payload stored in the tree.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        // serde_json's default map is ordered by key, so plain serialization
        // is already canonical.
        Ok(serde_json::to_vec(&self.fields)?)
    }
}

/// Field-level difference between two document revisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentDiff {
    /// Fields present only in the newer revision.
    pub added: Map<String, Value>,
    /// Fields present only in the older revision.
    pub removed: Map<String, Value>,
    /// Fields present in both with different values, as (old, new).
    pub changed: Map<String, Value>,
}

impl DocumentDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compute the structural field diff between two revisions. Scalars compare
/// by equality; arrays and objects compare structurally (serde_json's
/// `Value` equality is structural). Changed entries carry `[old, new]`.
pub fn diff_documents(older: &Document, newer: &Document) -> DocumentDiff {
    let mut diff = DocumentDiff::default();
    for (field, old_value) in older.fields() {
        match newer.get(field) {
            None => {
                diff.removed.insert(field.clone(), old_value.clone());
            }
            Some(new_value) if new_value != old_value => {
                diff.changed.insert(
                    field.clone(),
                    Value::Array(vec![old_value.clone(), new_value.clone()]),
                );
            }
            Some(_) => {}
        }
    }
    for (field, new_value) in newer.fields() {
        if older.get(field).is_none() {
            diff.added.insert(field.clone(), new_value.clone());
        }
    }
    diff
}

/// Apply a diff to a revision, producing the newer one. Inverse of
/// [`diff_documents`]; used by tests to verify the diff algebra.
pub fn apply_diff(base: &Document, diff: &DocumentDiff) -> Result<Document> {
    let mut fields = base.fields().clone();
    for field in diff.removed.keys() {
        fields.remove(field);
    }
    for (field, value) in &diff.added {
        fields.insert(field.clone(), value.clone());
    }
    for (field, pair) in &diff.changed {
        let new_value = pair
            .as_array()
            .and_then(|p| p.get(1))
            .ok_or_else(|| ChronError::InvalidArgument("malformed diff pair".to_string()))?;
        fields.insert(field.clone(), new_value.clone());
    }
    Document::new(fields)
}
