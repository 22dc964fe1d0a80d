//! The commit pipeline: build a new tree from the parent tree plus one
//! changed path, write the commit, CAS the branch ref, and attach the
//! transaction note. This is the only code path that advances a branch.

use serde_json::Value;
use tracing::warn;

use crate::config::DbConfig;
use crate::errors::{ChronError, Result};
use crate::hash::ObjectHash;
use crate::internal::object::blob::Blob;
use crate::internal::object::commit::Commit;
use crate::internal::object::note::Note;
use crate::internal::object::signature::Signature;
use crate::internal::object::tree::{Tree, TreeItemMode};
use crate::internal::store::{
    ObjectStore, RefTransition, empty_tree, read_path, upsert_path,
};

/// One requested mutation of a branch.
pub struct ChangeRequest<'a> {
    pub branch: &'a str,
    /// Tree path of the document file.
    pub path: &'a str,
    /// New blob content, or `None` to remove the path.
    pub content: Option<&'a [u8]>,
    pub message: &'a str,
    pub author: Signature,
    pub committer: Signature,
    /// Transaction trail to attach as a commit note.
    pub note: Option<Value>,
}

/// What one pipeline run produced.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub commit_id: ObjectHash,
    /// Head observed when the commit was built; the CAS expected-old.
    pub parent: Option<ObjectHash>,
    pub transition: RefTransition,
}

impl CommitOutcome {
    pub fn committed(&self) -> bool {
        self.transition.updated()
    }
}

/// Run the pipeline once. Returns `None` for a delete whose path does not
/// exist — a no-op that must not produce a commit. A `Rejected` transition
/// in the outcome means another writer moved the ref first; the caller
/// owns the retry policy.
pub fn commit_change(store: &dyn ObjectStore, req: ChangeRequest<'_>) -> Result<Option<CommitOutcome>> {
    let ref_name = DbConfig::branch_ref(req.branch);
    let head = store.resolve_ref(&ref_name)?;

    let head_tree = match &head {
        Some(commit_id) => Some(store.get_commit(commit_id)?.tree_id),
        None => None,
    };

    let entry = match req.content {
        Some(content) => {
            let blob = Blob::from_content(content);
            store.put_blob(&blob)?;
            Some((TreeItemMode::Blob, blob.id))
        }
        None => {
            // Deleting a path that is not there is a no-op, not a commit.
            let exists = match &head_tree {
                Some(tree) => read_path(store, tree, req.path)?.is_some(),
                None => false,
            };
            if !exists {
                return Ok(None);
            }
            None
        }
    };

    let new_root = match upsert_path(store, head_tree.as_ref(), req.path, entry)? {
        Some(root) => root,
        None => empty_tree(store)?,
    };

    let commit = Commit::new(
        req.author,
        req.committer.clone(),
        new_root,
        head.into_iter().collect(),
        req.message,
    );
    store.put_commit(&commit)?;

    let transition = store.update_ref(&ref_name, head.as_ref(), &commit.id, false)?;
    if transition.updated()
        && let Some(payload) = req.note
        && let Err(e) = append_note(store, &commit.id, &payload, &req.committer)
    {
        // Note failure must not fail the commit; readers tolerate
        // missing notes.
        warn!(commit = %commit.id, error = %e, "failed to append transaction note");
    }

    Ok(Some(CommitOutcome {
        commit_id: commit.id,
        parent: head,
        transition,
    }))
}

const NOTE_CAS_ATTEMPTS: usize = 5;

/// Append a note blob for `target` on the notes ref. The notes ref carries
/// a commit whose tree maps `<commit-hex>` to the note blob; updates go
/// through their own serialized CAS loop.
pub fn append_note(
    store: &dyn ObjectStore,
    target: &ObjectHash,
    payload: &Value,
    committer: &Signature,
) -> Result<()> {
    let note = Note::new(*target, serde_json::to_string(payload)?);
    store.put_raw(crate::internal::object::types::ObjectType::Blob, note.content.as_bytes())?;

    for _ in 0..NOTE_CAS_ATTEMPTS {
        let notes_head = store.resolve_ref(DbConfig::NOTES_REF)?;
        let items = match &notes_head {
            Some(head) => {
                let tree_id = store.get_commit(head)?.tree_id;
                store.get_tree(&tree_id)?.with_entry(
                    &target.to_string(),
                    Some(crate::internal::object::tree::TreeItem::new(
                        TreeItemMode::Blob,
                        note.id,
                        target.to_string(),
                    )),
                )
            }
            None => vec![crate::internal::object::tree::TreeItem::new(
                TreeItemMode::Blob,
                note.id,
                target.to_string(),
            )],
        };
        let tree = Tree::from_items(items)?;
        store.put_tree(&tree)?;
        let commit = Commit::new(
            committer.clone(),
            committer.clone(),
            tree.id,
            notes_head.into_iter().collect(),
            &format!("note for {target}"),
        );
        store.put_commit(&commit)?;
        if store
            .update_ref(DbConfig::NOTES_REF, commit.first_parent(), &commit.id, false)?
            .updated()
        {
            return Ok(());
        }
    }
    Err(ChronError::Conflict {
        subject: target.to_string(),
        branch: DbConfig::NOTES_REF.to_string(),
        detail: "note CAS attempts exhausted".to_string(),
    })
}

/// Read the note attached to `commit_id`, if any. Readers may observe a
/// commit before its note lands; absence is not an error.
pub fn read_note(store: &dyn ObjectStore, commit_id: &ObjectHash) -> Result<Option<Note>> {
    let Some(notes_head) = store.resolve_ref(DbConfig::NOTES_REF)? else {
        return Ok(None);
    };
    let tree_id = store.get_commit(&notes_head)?.tree_id;
    let tree = store.get_tree(&tree_id)?;
    let Some(item) = tree.entry(&commit_id.to_string()) else {
        return Ok(None);
    };
    let blob = store.get_blob(&item.id)?;
    Note::from_bytes_with_target(&blob.data, blob.id, *commit_id).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, set_hash_kind_scoped};
    use crate::internal::object::signature::SignatureType;
    use crate::internal::store::MemoryStore;
    use serde_json::json;

    fn sig() -> Signature {
        Signature::now(SignatureType::Committer, "chrondb", "chrondb@localhost")
    }

    fn author() -> Signature {
        Signature::now(SignatureType::Author, "chrondb", "chrondb@localhost")
    }

    fn save(store: &dyn ObjectStore, branch: &str, path: &str, content: &[u8]) -> CommitOutcome {
        commit_change(
            store,
            ChangeRequest {
                branch,
                path,
                content: Some(content),
                message: "save",
                author: author(),
                committer: sig(),
                note: Some(json!({"tx_id": "t-1", "operation": "save"})),
            },
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_initial_commit_creates_branch() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let store = MemoryStore::new();
        let outcome = save(&store, "main", "user/user_COLON_1.json", b"{\"v\":1}");
        assert_eq!(outcome.transition, RefTransition::Created);
        assert!(outcome.parent.is_none());
        assert_eq!(
            store.resolve_ref("refs/heads/main").unwrap(),
            Some(outcome.commit_id)
        );
    }

    #[test]
    fn test_second_commit_chains_to_first() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let store = MemoryStore::new();
        let first = save(&store, "main", "user/a.json", b"1");
        let second = save(&store, "main", "user/b.json", b"2");
        assert_eq!(second.parent, Some(first.commit_id));

        let commit = store.get_commit(&second.commit_id).unwrap();
        assert_eq!(commit.first_parent(), Some(&first.commit_id));
        // The untouched sibling keeps its object id.
        let sibling = read_path(&store, &commit.tree_id, "user/a.json")
            .unwrap()
            .unwrap();
        assert_eq!(sibling.id, Blob::from_content(b"1").id);
    }

    #[test]
    fn test_delete_missing_path_is_noop() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let store = MemoryStore::new();
        let result = commit_change(
            &store,
            ChangeRequest {
                branch: "main",
                path: "user/missing.json",
                content: None,
                message: "delete",
                author: author(),
                committer: sig(),
                note: None,
            },
        )
        .unwrap();
        assert!(result.is_none());
        assert!(store.resolve_ref("refs/heads/main").unwrap().is_none());
    }

    #[test]
    fn test_delete_removes_path_but_keeps_history() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let store = MemoryStore::new();
        let saved = save(&store, "main", "user/a.json", b"1");
        let deleted = commit_change(
            &store,
            ChangeRequest {
                branch: "main",
                path: "user/a.json",
                content: None,
                message: "delete",
                author: author(),
                committer: sig(),
                note: None,
            },
        )
        .unwrap()
        .unwrap();
        assert!(deleted.committed());

        let head_tree = store.get_commit(&deleted.commit_id).unwrap().tree_id;
        assert!(read_path(&store, &head_tree, "user/a.json").unwrap().is_none());
        // The old commit still resolves the old content.
        let old_tree = store.get_commit(&saved.commit_id).unwrap().tree_id;
        assert!(read_path(&store, &old_tree, "user/a.json").unwrap().is_some());
    }

    #[test]
    fn test_note_written_after_commit_and_readable() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let store = MemoryStore::new();
        let outcome = save(&store, "main", "user/a.json", b"1");
        let note = read_note(&store, &outcome.commit_id).unwrap().unwrap();
        let payload = note.payload().unwrap();
        assert_eq!(payload["tx_id"], "t-1");

        // A commit without a note is tolerated.
        let other = ObjectHash::new(b"unrelated");
        assert!(read_note(&store, &other).unwrap().is_none());
    }

    #[test]
    fn test_notes_accumulate_across_commits() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let store = MemoryStore::new();
        let first = save(&store, "main", "user/a.json", b"1");
        let second = save(&store, "main", "user/a.json", b"2");
        assert!(read_note(&store, &first.commit_id).unwrap().is_some());
        assert!(read_note(&store, &second.commit_id).unwrap().is_some());
    }

    #[test]
    fn test_stale_expected_head_is_rejected() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let store = MemoryStore::new();
        save(&store, "main", "user/a.json", b"1");
        let head = store.resolve_ref("refs/heads/main").unwrap();

        // Another writer advances the branch between resolve and CAS; emulate
        // by moving the ref underneath a manually built outcome.
        let interloper = save(&store, "main", "user/b.json", b"2");
        assert_ne!(Some(interloper.commit_id), head);

        let stale = store
            .update_ref(
                "refs/heads/main",
                head.as_ref(),
                &ObjectHash::new(b"stale"),
                false,
            )
            .unwrap();
        assert_eq!(stale, RefTransition::Rejected);
    }
}
