//! Object model definitions for blobs, trees, commits and notes, plus the
//! trait that lets the stores create strongly typed values from raw bytes.
//!
//! The encodings are byte-for-byte the Git formats, so a ChronDB repository
//! directory is readable by stock Git tooling.
pub mod blob;
pub mod commit;
pub mod note;
pub mod signature;
pub mod tree;
pub mod types;

use std::fmt::Display;

use crate::{errors::ChronError, hash::ObjectHash, internal::object::types::ObjectType};

/// **The Object Trait**
/// Defines the common interface for all object types: blobs, trees, commits,
/// and notes.
pub trait ObjectTrait: Send + Sync + Display {
    /// Creates a new object from a byte slice.
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ChronError>
    where
        Self: Sized;

    /// Returns the type of the object.
    fn get_type(&self) -> ObjectType;

    fn get_size(&self) -> usize;

    fn to_data(&self) -> Result<Vec<u8>, ChronError>;

    /// Computes the object hash from serialized data.
    fn object_hash(&self) -> Result<ObjectHash, ChronError> {
        let data = self.to_data()?;
        Ok(ObjectHash::from_type_and_data(self.get_type(), &data))
    }
}
