//! Note object implementation.
//!
//! Notes attach metadata to existing commits without modifying them. ChronDB
//! writes one note per commit on the `refs/notes/chrondb` ref, carrying the
//! transaction trail as a single JSON object: `tx_id`, `origin`, `timestamp`,
//! `operation`, `document_id`, `branch`, and optional `metadata` and `flags`.
//!
//! In the object model a note is a blob; the association with its target
//! commit is a tree entry on the notes ref whose name is the target commit id.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::ChronError;
use crate::hash::ObjectHash;
use crate::internal::object::ObjectTrait;
use crate::internal::object::types::ObjectType;

/// A note blob and the commit it annotates.
#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    /// Id of this note object (the underlying blob).
    pub id: ObjectHash,
    /// Id of the commit this note annotates.
    pub target_commit_id: ObjectHash,
    /// JSON text of the note.
    pub content: String,
}

impl PartialEq for Note {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Note {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "note for commit: {}", self.target_commit_id)?;
        writeln!(f, "{}", self.content)
    }
}

impl Note {
    /// Create a note for `target_commit_id` with the given JSON content.
    pub fn new(target_commit_id: ObjectHash, content: String) -> Self {
        let id = ObjectHash::from_type_and_data(ObjectType::Blob, content.as_bytes());
        Self {
            id,
            target_commit_id,
            content,
        }
    }

    /// Parse the content as the transaction-trail JSON object.
    pub fn payload(&self) -> Result<serde_json::Value, ChronError> {
        serde_json::from_str(&self.content).map_err(Into::into)
    }

    /// Recreate a note read back from the store, keeping the association.
    pub fn from_bytes_with_target(
        data: &[u8],
        hash: ObjectHash,
        target_commit_id: ObjectHash,
    ) -> Result<Self, ChronError> {
        let content = String::from_utf8(data.to_vec()).map_err(|e| {
            ChronError::InvalidObject(format!("invalid UTF-8 content: {e}"), "note")
        })?;
        Ok(Note {
            id: hash,
            target_commit_id,
            content,
        })
    }
}

impl ObjectTrait for Note {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ChronError>
    where
        Self: Sized,
    {
        // Target association is carried by the notes tree, not the blob.
        Note::from_bytes_with_target(data, hash, ObjectHash::default())
    }

    /// Notes are stored as blobs in the object database.
    fn get_type(&self) -> ObjectType {
        ObjectType::Blob
    }

    fn get_size(&self) -> usize {
        self.content.len()
    }

    fn to_data(&self) -> Result<Vec<u8>, ChronError> {
        Ok(self.content.as_bytes().to_vec())
    }
}
