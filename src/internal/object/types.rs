//! Object type enumeration shared across the stores and the commit pipeline.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::ChronError;

/// The closed set of object kinds a ChronDB repository contains.
///
/// * `Commit`: parent id(s), root tree id, identities, timestamp, message.
/// * `Tree`: ordered mapping from name to (mode, blob|tree id).
/// * `Blob`: opaque byte content; documents and notes are stored as blobs.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Commit = 1,
    Tree,
    Blob,
}

const COMMIT_OBJECT_TYPE: &[u8] = b"commit";
const TREE_OBJECT_TYPE: &[u8] = b"tree";
const BLOB_OBJECT_TYPE: &[u8] = b"blob";

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectType::Blob => write!(f, "blob"),
            ObjectType::Tree => write!(f, "tree"),
            ObjectType::Commit => write!(f, "commit"),
        }
    }
}

impl ObjectType {
    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            ObjectType::Commit => COMMIT_OBJECT_TYPE,
            ObjectType::Tree => TREE_OBJECT_TYPE,
            ObjectType::Blob => BLOB_OBJECT_TYPE,
        }
    }

    /// Parses a string representation of an object type.
    pub fn from_string(s: &str) -> Result<ObjectType, ChronError> {
        match s {
            "blob" => Ok(ObjectType::Blob),
            "tree" => Ok(ObjectType::Tree),
            "commit" => Ok(ObjectType::Commit),
            _ => Err(ChronError::InvalidObjectType(s.to_string())),
        }
    }

    /// Convert an object type to a number for record encodings.
    pub fn to_u8(&self) -> u8 {
        match self {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
        }
    }

    /// Convert a number back to an object type.
    pub fn from_u8(number: u8) -> Result<ObjectType, ChronError> {
        match number {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            _ => Err(ChronError::InvalidObjectType(format!(
                "Invalid object type number: {number}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify ObjectType::Blob converts to its ASCII byte representation "blob".
    #[test]
    fn test_object_type_to_bytes() {
        assert_eq!(ObjectType::Blob.to_bytes(), b"blob");
        assert_eq!(ObjectType::Tree.to_bytes(), b"tree");
        assert_eq!(ObjectType::Commit.to_bytes(), b"commit");
    }

    #[test]
    fn test_object_type_from_string() {
        assert_eq!(ObjectType::from_string("blob").unwrap(), ObjectType::Blob);
        assert_eq!(ObjectType::from_string("tree").unwrap(), ObjectType::Tree);
        assert_eq!(
            ObjectType::from_string("commit").unwrap(),
            ObjectType::Commit
        );
        assert!(ObjectType::from_string("invalid_type").is_err());
    }

    #[test]
    fn test_object_type_u8_round_trip() {
        for ty in [ObjectType::Commit, ObjectType::Tree, ObjectType::Blob] {
            assert_eq!(ObjectType::from_u8(ty.to_u8()).unwrap(), ty);
        }
        assert!(ObjectType::from_u8(9).is_err());
    }
}
