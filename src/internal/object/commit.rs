//! The Commit object records one state of a branch: the root tree at that
//! point in time, the parent commit(s), the author/committer identities, and
//! a message. In ChronDB every successful `save` or `delete` produces exactly
//! one commit whose tree differs from its parent's only at the affected
//! document path, so the commit chain of a branch is the write history of
//! that branch.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::ChronError;
use crate::hash::ObjectHash;
use crate::internal::object::ObjectTrait;
use crate::internal::object::signature::Signature;
use crate::internal::object::types::ObjectType;

/// The `Commit` struct is used to represent a commit object.
///
/// - The tree id points to the top level tree for this commit, which reflects
///   the complete state of the repository at the time of the commit.
/// - The parent ids allow construction of the full history as a linked list;
///   the initial commit of a branch has no parent, a merge commit has two.
/// - The author and committer fields contain name, email, timestamp and
///   timezone; ChronDB fills both from the transaction layer.
#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: ObjectHash,
    pub tree_id: ObjectHash,
    pub parent_commit_ids: Vec<ObjectHash>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tree: {}", self.tree_id)?;
        for parent in self.parent_commit_ids.iter() {
            writeln!(f, "parent: {parent}")?;
        }
        writeln!(f, "author {}", self.author)?;
        writeln!(f, "committer {}", self.committer)?;
        writeln!(f, "{}", self.message)
    }
}

impl Commit {
    pub fn new(
        author: Signature,
        committer: Signature,
        tree_id: ObjectHash,
        parent_commit_ids: Vec<ObjectHash>,
        message: &str,
    ) -> Commit {
        let mut commit = Commit {
            id: ObjectHash::default(),
            tree_id,
            parent_commit_ids,
            author,
            committer,
            message: message.to_string(),
        };
        commit.id = ObjectHash::from_type_and_data(
            ObjectType::Commit,
            &commit.to_data().expect("commit serialization is infallible"),
        );
        commit
    }

    /// First parent, if any. Branch history in ChronDB is linear except for
    /// merge commits, and history walks follow the first parent.
    pub fn first_parent(&self) -> Option<&ObjectHash> {
        self.parent_commit_ids.first()
    }

    /// The first non-empty line of the message.
    pub fn format_message(&self) -> String {
        self.message
            .lines()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.to_owned())
            .unwrap_or_else(|| self.message.clone())
    }
}

impl ObjectTrait for Commit {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ChronError>
    where
        Self: Sized,
    {
        let invalid = || ChronError::InvalidObject(hash.to_string(), "commit");
        let mut commit = data;

        // Find the tree id and move past it; 5 is the length of "tree ".
        let tree_end = commit.find_byte(0x0a).ok_or_else(invalid)?;
        let tree_id = ObjectHash::from_str(
            commit
                .get(5..tree_end)
                .and_then(|s| s.to_str().ok())
                .ok_or_else(invalid)?,
        )
        .map_err(ChronError::InvalidHashValue)?;
        let binding = commit[tree_end + 1..].to_vec();
        commit = &binding;

        // Every line before "author" that starts with "parent " carries one
        // parent commit id; 7 is the length of "parent ".
        let author_begin = commit.find("author").ok_or_else(invalid)?;
        let parent_commit_ids = commit[..author_begin]
            .find_iter("parent")
            .map(|parent| {
                let parent_end = commit[parent..].find_byte(0x0a).ok_or_else(invalid)?;
                ObjectHash::from_str(
                    commit
                        .get(parent + 7..parent + parent_end)
                        .and_then(|s| s.to_str().ok())
                        .ok_or_else(invalid)?,
                )
                .map_err(ChronError::InvalidHashValue)
            })
            .collect::<Result<Vec<ObjectHash>, ChronError>>()?;
        let binding = commit[author_begin..].to_vec();
        commit = &binding;

        // Author and committer lines, then a blank line, then the message.
        let author_end = commit.find_byte(0x0a).ok_or_else(invalid)?;
        let author = Signature::from_data(commit[..author_end].to_vec())?;
        let binding = commit[author_end + 1..].to_vec();
        commit = &binding;

        let committer_end = commit.find_byte(0x0a).ok_or_else(invalid)?;
        let committer = Signature::from_data(commit[..committer_end].to_vec())?;
        let message = commit[committer_end + 1..]
            .to_str()
            .map_err(|_| invalid())?
            .to_string();

        Ok(Commit {
            id: hash,
            tree_id,
            parent_commit_ids,
            author,
            committer,
            message,
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Commit
    }

    fn get_size(&self) -> usize {
        self.message.len()
    }

    fn to_data(&self) -> Result<Vec<u8>, ChronError> {
        let mut data = Vec::new();

        data.extend(b"tree ");
        data.extend(self.tree_id.to_string().as_bytes());
        data.extend(&[0x0a]);

        for parent_commit_id in &self.parent_commit_ids {
            data.extend(b"parent ");
            data.extend(parent_commit_id.to_string().as_bytes());
            data.extend(&[0x0a]);
        }

        data.extend(self.author.to_data()?);
        data.extend(&[0x0a]);
        data.extend(self.committer.to_data()?);
        data.extend(&[0x0a]);
        data.extend(self.message.as_bytes());

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, set_hash_kind_scoped};
    use crate::internal::object::signature::SignatureType;

    fn sig(kind: SignatureType, ts: i64) -> Signature {
        Signature {
            signature_type: kind,
            name: "chrondb".to_string(),
            email: "chrondb@localhost".to_string(),
            timestamp: ts,
            timezone: "+0000".to_string(),
        }
    }

    #[test]
    fn test_commit_round_trip_no_parent() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let tree_id = ObjectHash::new(b"tree-seed");
        let commit = Commit::new(
            sig(SignatureType::Author, 1700000000),
            sig(SignatureType::Committer, 1700000000),
            tree_id,
            vec![],
            "save user:1\n",
        );
        let data = commit.to_data().unwrap();
        let restored = Commit::from_bytes(&data, commit.id).unwrap();
        assert_eq!(restored, commit);
        assert_eq!(restored.tree_id, tree_id);
        assert!(restored.first_parent().is_none());
        assert_eq!(restored.object_hash().unwrap(), commit.id);
    }

    #[test]
    fn test_commit_round_trip_with_parents() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let p1 = ObjectHash::new(b"p1");
        let p2 = ObjectHash::new(b"p2");
        let commit = Commit::new(
            sig(SignatureType::Author, 1700000100),
            sig(SignatureType::Committer, 1700000101),
            ObjectHash::new(b"tree"),
            vec![p1, p2],
            "merge dev into main\n",
        );
        let restored = Commit::from_bytes(&commit.to_data().unwrap(), commit.id).unwrap();
        assert_eq!(restored.parent_commit_ids, vec![p1, p2]);
        assert_eq!(restored.first_parent(), Some(&p1));
        assert_eq!(restored.committer.timestamp, 1700000101);
    }

    #[test]
    fn test_format_message_takes_first_line() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let commit = Commit::new(
            sig(SignatureType::Author, 1),
            sig(SignatureType::Committer, 1),
            ObjectHash::new(b"t"),
            vec![],
            "\nsave order:9\n\ndetails follow\n",
        );
        assert_eq!(commit.format_message(), "save order:9");
    }

    #[test]
    fn test_rejects_malformed_bytes() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let hash = ObjectHash::new(b"x");
        assert!(Commit::from_bytes(b"not a commit", hash).is_err());
    }
}
