//! The Blob object stores raw byte content. In ChronDB every document
//! revision is one blob holding the document's canonical JSON bytes, and
//! every transaction note is a blob as well.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::ChronError;
use crate::hash::ObjectHash;
use crate::internal::object::ObjectTrait;
use crate::internal::object::types::ObjectType;

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub id: ObjectHash,
    pub data: Vec<u8>,
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "blob {}", self.id)
    }
}

impl Blob {
    /// Build a blob from content, computing its content address.
    pub fn from_content(data: &[u8]) -> Blob {
        Blob {
            id: ObjectHash::from_type_and_data(ObjectType::Blob, data),
            data: data.to_vec(),
        }
    }

    /// UTF-8 view of the content, for JSON document blobs.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl ObjectTrait for Blob {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ChronError> {
        Ok(Blob {
            id: hash,
            data: data.to_vec(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Blob
    }

    fn get_size(&self) -> usize {
        self.data.len()
    }

    fn to_data(&self) -> Result<Vec<u8>, ChronError> {
        Ok(self.data.clone())
    }
}
