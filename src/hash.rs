//! Object ids for the ChronDB repository format.
//!
//! Every blob, tree, commit and note is addressed by the digest of its
//! `<type> <len>\0<payload>` header, so equal document revisions collapse to
//! one object and an id can be recomputed from content alone. The digest
//! algorithm is a property of the repository format: SHA-1 by default, with
//! SHA-256 repositories supported through the same id type. The active kind
//! is held thread-locally; set it once at startup to match the repository
//! being opened, and use the scoped guard when a narrower binding is needed.

use std::{cell::RefCell, fmt::Display, hash::Hash, io, str::FromStr};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sha1::Digest;

use crate::internal::object::types::ObjectType;

/// Digest algorithm of a repository format (selector only, no data
/// attached). Defaults to SHA-1.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Deserialize,
    Serialize,
    Encode,
    Decode,
)]
pub enum HashKind {
    #[default]
    Sha1,
    Sha256,
}

impl HashKind {
    /// Byte length of an id under this format.
    pub const fn size(&self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        }
    }

    /// Hex string length of an id under this format.
    pub const fn hex_len(&self) -> usize {
        match self {
            HashKind::Sha1 => 40,
            HashKind::Sha256 => 64,
        }
    }

    /// Lowercase name, as it appears in configuration.
    pub const fn as_str(&self) -> &'static str {
        match self {
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
        }
    }

    fn digest(&self, data: &[u8]) -> ObjectHash {
        match self {
            HashKind::Sha1 => {
                let digest = sha1::Sha1::digest(data);
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(digest.as_ref());
                ObjectHash::Sha1(bytes)
            }
            HashKind::Sha256 => {
                let digest = sha2::Sha256::digest(data);
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(digest.as_ref());
                ObjectHash::Sha256(bytes)
            }
        }
    }
}

impl Display for HashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashKind::Sha1),
            "sha256" => Ok(HashKind::Sha256),
            other => Err(format!("unknown hash kind `{other}`")),
        }
    }
}

/// A content address in the object graph: the digest bytes of one object
/// under the repository's hash kind. Converts to and from hex for ref files
/// and note tree entries, and reads its fixed-width raw form from streams.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, Encode, Decode,
)]
pub enum ObjectHash {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl Default for ObjectHash {
    fn default() -> Self {
        ObjectHash::Sha1([0u8; 20])
    }
}

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_ref()))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        match self {
            ObjectHash::Sha1(bytes) => bytes.as_slice(),
            ObjectHash::Sha256(bytes) => bytes.as_slice(),
        }
    }
}

/// Parse hex (40 chars for SHA-1, 64 for SHA-256) into an id; the length
/// alone identifies the kind, so ref files need no format marker.
impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        match bytes.len() {
            20 => {
                let mut h = [0u8; 20];
                h.copy_from_slice(&bytes);
                Ok(ObjectHash::Sha1(h))
            }
            32 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(&bytes);
                Ok(ObjectHash::Sha256(h))
            }
            other => Err(format!("{other} bytes is not a valid id length")),
        }
    }
}

impl ObjectHash {
    /// The all-zero id of a kind: the expected parent when a branch ref is
    /// first created, never the address of a real object.
    pub fn zero(kind: HashKind) -> ObjectHash {
        match kind {
            HashKind::Sha1 => ObjectHash::Sha1([0u8; 20]),
            HashKind::Sha256 => ObjectHash::Sha256([0u8; 32]),
        }
    }

    /// Hex form of [`ObjectHash::zero`].
    pub fn zero_str(kind: HashKind) -> String {
        "0".repeat(kind.hex_len())
    }

    /// True for the branch-creation sentinel of either kind.
    pub fn is_zero(&self) -> bool {
        self.as_ref().iter().all(|b| *b == 0)
    }

    /// The kind this id was produced under.
    pub fn kind(&self) -> HashKind {
        match self {
            ObjectHash::Sha1(_) => HashKind::Sha1,
            ObjectHash::Sha256(_) => HashKind::Sha256,
        }
    }

    /// Byte length of the id.
    pub fn size(&self) -> usize {
        self.kind().size()
    }

    /// Digest raw bytes under the current thread's hash kind.
    pub fn new(data: &[u8]) -> ObjectHash {
        get_hash_kind().digest(data)
    }

    /// Address an object: digest the standard `<type> <len>\0` header
    /// followed by the payload. This is the only way real object ids are
    /// minted, so the same bytes stored as a blob and as a commit can never
    /// collide.
    pub fn from_type_and_data(object_type: ObjectType, data: &[u8]) -> ObjectHash {
        let mut framed: Vec<u8> = Vec::with_capacity(data.len() + 16);
        framed.extend(object_type.to_bytes());
        framed.push(b' ');
        framed.extend(data.len().to_string().as_bytes());
        framed.push(b'\x00');
        framed.extend(data);
        ObjectHash::new(&framed)
    }

    /// Reconstruct an id from raw digest bytes of the current kind.
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectHash, String> {
        let kind = get_hash_kind();
        if bytes.len() != kind.size() {
            return Err(format!(
                "expected {} id bytes for {kind}, got {}",
                kind.size(),
                bytes.len()
            ));
        }
        let mut id = ObjectHash::zero(kind);
        id.as_mut().copy_from_slice(bytes);
        Ok(id)
    }

    /// Read one fixed-width raw id from a stream, sized by the current
    /// kind; tree entries and bundle frames store ids this way.
    pub fn from_stream(data: &mut impl io::Read) -> io::Result<ObjectHash> {
        let mut id = ObjectHash::zero(get_hash_kind());
        data.read_exact(id.as_mut())?;
        Ok(id)
    }

    /// Raw digest bytes, owned.
    pub fn to_data(self) -> Vec<u8> {
        self.as_ref().to_vec()
    }

    fn as_mut(&mut self) -> &mut [u8] {
        match self {
            ObjectHash::Sha1(bytes) => bytes.as_mut_slice(),
            ObjectHash::Sha256(bytes) => bytes.as_mut_slice(),
        }
    }
}

thread_local! {
    /// Hash kind of the repository this thread is operating on. Worker
    /// threads (index catch-up, tests) bind it on entry; the default is
    /// SHA-1 like the default repository format.
    static REPO_HASH_KIND: RefCell<HashKind> = const { RefCell::new(HashKind::Sha1) };
}

/// Set the thread's hash kind; call once at startup to match the
/// repository format being opened.
pub fn set_hash_kind(kind: HashKind) {
    REPO_HASH_KIND.with(|k| {
        *k.borrow_mut() = kind;
    });
}

/// Hash kind the current thread mints and parses ids under.
pub fn get_hash_kind() -> HashKind {
    REPO_HASH_KIND.with(|k| *k.borrow())
}

/// Guard restoring the previous hash kind when a scoped binding ends.
pub struct HashKindGuard {
    prev: HashKind,
}

impl Drop for HashKindGuard {
    fn drop(&mut self) {
        set_hash_kind(self.prev);
    }
}

/// Bind `kind` for the current thread until the returned guard drops; used
/// by index workers entering a repository and by tests.
pub fn set_hash_kind_scoped(kind: HashKind) -> HashKindGuard {
    let prev = get_hash_kind();
    set_hash_kind(kind);
    HashKindGuard { prev }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    /// The empty blob and the empty tree have well-known SHA-1 addresses;
    /// header hashing must reproduce them exactly or on-disk repositories
    /// stop being readable by stock tooling.
    #[test]
    fn test_known_header_addresses() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        assert_eq!(
            ObjectHash::from_type_and_data(ObjectType::Blob, b"").to_string(),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
        assert_eq!(
            ObjectHash::from_type_and_data(ObjectType::Tree, b"").to_string(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    /// The object type participates in the header, so a document's bytes
    /// addressed as a blob can never collide with a commit or tree carrying
    /// the same payload.
    #[test]
    fn test_type_scopes_the_address() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let payload = br#"{"_table":"user","id":"user:1"}"#;
        let as_blob = ObjectHash::from_type_and_data(ObjectType::Blob, payload);
        let as_tree = ObjectHash::from_type_and_data(ObjectType::Tree, payload);
        let as_commit = ObjectHash::from_type_and_data(ObjectType::Commit, payload);
        assert_ne!(as_blob, as_tree);
        assert_ne!(as_blob, as_commit);
        assert_ne!(as_tree, as_commit);
    }

    /// Equal canonical JSON always mints the same address; a one-field
    /// change mints a new one. This is what lets history deduplicate
    /// no-op saves at the blob level.
    #[test]
    fn test_canonical_document_bytes_are_stable_addresses() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let rev1 = br#"{"_table":"user","id":"user:1","name":"Alice"}"#;
        let rev1_again = rev1.to_vec();
        let rev2 = br#"{"_table":"user","id":"user:1","name":"Alba"}"#;

        let id1 = ObjectHash::from_type_and_data(ObjectType::Blob, rev1);
        assert_eq!(
            id1,
            ObjectHash::from_type_and_data(ObjectType::Blob, &rev1_again)
        );
        assert_ne!(id1, ObjectHash::from_type_and_data(ObjectType::Blob, rev2));
    }

    /// Ids round-trip through the hex form used by ref files and note tree
    /// entries, and the hex length alone identifies the kind.
    #[test]
    fn test_hex_round_trip_for_both_kinds() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let sha1_id = ObjectHash::from_type_and_data(ObjectType::Blob, b"doc bytes");
        assert_eq!(sha1_id.to_string().len(), HashKind::Sha1.hex_len());
        assert_eq!(ObjectHash::from_str(&sha1_id.to_string()).unwrap(), sha1_id);

        let _guard = set_hash_kind_scoped(HashKind::Sha256);
        let sha256_id = ObjectHash::from_type_and_data(ObjectType::Blob, b"doc bytes");
        assert_eq!(sha256_id.kind(), HashKind::Sha256);
        assert_eq!(sha256_id.size(), 32);
        assert_eq!(sha256_id.to_string().len(), HashKind::Sha256.hex_len());
        assert_eq!(
            ObjectHash::from_str(&sha256_id.to_string()).unwrap(),
            sha256_id
        );
        // Same payload, different repository format, unrelated address.
        assert_ne!(sha1_id.to_data(), sha256_id.to_data());

        assert!(ObjectHash::from_str("not-hex").is_err());
        assert!(ObjectHash::from_str("abcdef").is_err());
    }

    /// The zero id is the CAS expected-parent for branch creation: all
    /// zeros, recognized in both widths, and never minted for content.
    #[test]
    fn test_zero_id_is_the_branch_creation_sentinel() {
        for kind in [HashKind::Sha1, HashKind::Sha256] {
            let zero = ObjectHash::zero(kind);
            assert!(zero.is_zero());
            assert_eq!(zero.kind(), kind);
            assert_eq!(zero.to_string(), ObjectHash::zero_str(kind));
            assert_eq!(ObjectHash::from_str(&ObjectHash::zero_str(kind)).unwrap(), zero);
        }
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        assert!(!ObjectHash::from_type_and_data(ObjectType::Blob, b"").is_zero());
    }

    /// Tree entries and bundle frames carry raw fixed-width ids; reading
    /// two back-to-back must yield both, and a short read must fail rather
    /// than zero-fill.
    #[test]
    fn test_raw_ids_from_stream() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let first = ObjectHash::from_type_and_data(ObjectType::Blob, b"first");
        let second = ObjectHash::from_type_and_data(ObjectType::Blob, b"second");

        let mut frame = first.to_data();
        frame.extend(second.to_data());
        let mut reader = std::io::Cursor::new(frame);
        assert_eq!(ObjectHash::from_stream(&mut reader).unwrap(), first);
        assert_eq!(ObjectHash::from_stream(&mut reader).unwrap(), second);
        assert!(ObjectHash::from_stream(&mut reader).is_err());
    }

    /// `from_bytes` accepts only the width of the thread's hash kind.
    #[test]
    fn test_from_bytes_enforces_kind_width() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let id = ObjectHash::from_type_and_data(ObjectType::Blob, b"x");
        assert_eq!(ObjectHash::from_bytes(id.as_ref()).unwrap(), id);
        assert!(ObjectHash::from_bytes(&[0u8; 19]).is_err());
        assert!(ObjectHash::from_bytes(&[0u8; 32]).is_err());

        let _guard = set_hash_kind_scoped(HashKind::Sha256);
        assert!(ObjectHash::from_bytes(&[0u8; 20]).is_err());
        assert!(ObjectHash::from_bytes(&[0u8; 32]).is_ok());
    }

    /// The scoped guard restores the outer repository format on every exit
    /// path, including nesting.
    #[test]
    fn test_scoped_kind_nests_and_restores() {
        let _outer = set_hash_kind_scoped(HashKind::Sha1);
        assert_eq!(get_hash_kind(), HashKind::Sha1);
        {
            let _inner = set_hash_kind_scoped(HashKind::Sha256);
            assert_eq!(get_hash_kind(), HashKind::Sha256);
            assert_eq!(ObjectHash::new(b"payload").kind(), HashKind::Sha256);
        }
        assert_eq!(get_hash_kind(), HashKind::Sha1);
        assert_eq!(ObjectHash::new(b"payload").kind(), HashKind::Sha1);
    }
}
