//! The document engine: `save`, `get`, `delete`, listing, history and
//! point-in-time reads atop the object store and the commit pipeline. Every
//! operation takes an optional branch and defaults to the configured one.
//!
//! The tree path of a document is always derived from its id prefix; the
//! `_table` field is metadata that listing filters on. The engine performs a
//! single commit attempt per call; the durability layer wraps it with the
//! WAL and the OCC retry loop.
pub mod validation;

use std::sync::Arc;

use rayon::prelude::*;

use crate::config::DbConfig;
use crate::document::{Document, DocumentDiff, DocumentId, diff_documents};
use crate::errors::{ChronError, Result};
use crate::hash::ObjectHash;
use crate::internal::codec;
use crate::internal::object::commit::Commit;
use crate::internal::object::signature::{Signature, SignatureType};
use crate::internal::pipeline::{ChangeRequest, CommitOutcome, commit_change};
use crate::internal::store::{ObjectStore, collect_files, read_path, walk_commits};
use crate::transaction;
use validation::ValidationRegistry;

/// One entry of a document's history, newest first. `document` is `None`
/// for the tombstone a delete leaves behind.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub commit_id: ObjectHash,
    pub timestamp: i64,
    pub author: String,
    pub message: String,
    pub document: Option<Document>,
}

pub struct DocumentEngine {
    store: Arc<dyn ObjectStore>,
    config: DbConfig,
    validators: ValidationRegistry,
}

impl DocumentEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: DbConfig) -> DocumentEngine {
        DocumentEngine {
            store,
            config,
            validators: ValidationRegistry::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn validators(&self) -> &ValidationRegistry {
        &self.validators
    }

    fn data_prefix(&self) -> Option<&str> {
        self.config.data_dir.as_deref()
    }

    fn doc_path(&self, id: &str) -> Result<String> {
        let key = DocumentId::parse(id)?;
        Ok(codec::doc_path(self.data_prefix(), &key.table, id))
    }

    fn signatures(&self) -> (Signature, Signature) {
        let tx = transaction::current();
        let author_name = tx.user.as_deref().unwrap_or(&self.config.committer_name);
        (
            Signature::now(SignatureType::Author, author_name, &self.config.committer_email),
            Signature::now(
                SignatureType::Committer,
                &self.config.committer_name,
                &self.config.committer_email,
            ),
        )
    }

    fn head_tree(&self, branch: &str) -> Result<Option<ObjectHash>> {
        match self.store.resolve_ref(&DbConfig::branch_ref(branch))? {
            Some(head) => Ok(Some(self.store.get_commit(&head)?.tree_id)),
            None => Ok(None),
        }
    }

    fn parse_blob(&self, blob_id: &ObjectHash) -> Result<Document> {
        let blob = self.store.get_blob(blob_id)?;
        Document::from_json(&blob.to_string_lossy())
    }

    /// Store a document on the default branch.
    pub fn save(&self, doc: Document) -> Result<(Document, CommitOutcome)> {
        self.save_on(&self.config.default_branch, doc)
    }

    /// Store a document on `branch`. A single pipeline attempt: a CAS
    /// rejection surfaces as `Conflict` and the caller owns the retries.
    pub fn save_on(&self, branch: &str, doc: Document) -> Result<(Document, CommitOutcome)> {
        self.validators.validate(&doc)?;
        let stored = doc.with_table()?;
        let id = stored.id()?.to_string();
        let path = self.doc_path(&id)?;
        let payload = stored.to_canonical_json()?;

        let tx = transaction::current();
        let (author, committer) = self.signatures();
        let outcome = commit_change(
            self.store.as_ref(),
            ChangeRequest {
                branch,
                path: &path,
                content: Some(&payload),
                message: &format!("save {id}"),
                author,
                committer,
                note: Some(tx.note_payload("save", &id, branch)),
            },
        )?
        .expect("a save always produces a pipeline outcome");

        if !outcome.committed() {
            return Err(ChronError::Conflict {
                subject: id,
                branch: branch.to_string(),
                detail: "branch head moved during save".to_string(),
            });
        }
        Ok((stored, outcome))
    }

    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        self.get_on(&self.config.default_branch, id)
    }

    pub fn get_on(&self, branch: &str, id: &str) -> Result<Option<Document>> {
        let path = self.doc_path(id)?;
        let Some(tree) = self.head_tree(branch)? else {
            return Ok(None);
        };
        match read_path(self.store.as_ref(), &tree, &path)? {
            Some(item) => self.parse_blob(&item.id).map(Some),
            None => Ok(None),
        }
    }

    /// Remove a document. Returns the commit outcome, or `None` when the
    /// document did not exist (no commit is produced).
    pub fn delete(&self, id: &str) -> Result<Option<CommitOutcome>> {
        self.delete_on(&self.config.default_branch, id)
    }

    pub fn delete_on(&self, branch: &str, id: &str) -> Result<Option<CommitOutcome>> {
        let path = self.doc_path(id)?;
        let tx = transaction::current();
        let (author, committer) = self.signatures();
        let outcome = commit_change(
            self.store.as_ref(),
            ChangeRequest {
                branch,
                path: &path,
                content: None,
                message: &format!("delete {id}"),
                author,
                committer,
                note: Some(tx.note_payload("delete", id, branch)),
            },
        )?;
        match outcome {
            None => Ok(None),
            Some(outcome) if outcome.committed() => Ok(Some(outcome)),
            Some(_) => Err(ChronError::Conflict {
                subject: id.to_string(),
                branch: branch.to_string(),
                detail: "branch head moved during delete".to_string(),
            }),
        }
    }

    fn document_files(&self, tree: &ObjectHash) -> Result<Vec<(String, ObjectHash)>> {
        let prefix = match self.data_prefix() {
            Some(p) if !p.is_empty() => format!("{p}/"),
            _ => String::new(),
        };
        let files = collect_files(self.store.as_ref(), tree, &prefix)?;
        Ok(files
            .into_iter()
            .filter(|(path, _)| path.ends_with(codec::DOC_SUFFIX))
            .collect())
    }

    /// All documents whose id starts with `prefix`. Order is undefined.
    pub fn list_by_prefix(&self, prefix: &str) -> Result<Vec<Document>> {
        self.list_by_prefix_on(&self.config.default_branch, prefix)
    }

    pub fn list_by_prefix_on(&self, branch: &str, prefix: &str) -> Result<Vec<Document>> {
        let Some(tree) = self.head_tree(branch)? else {
            return Ok(Vec::new());
        };
        let mut matches = Vec::new();
        for (path, blob_id) in self.document_files(&tree)? {
            if let Some(id) = codec::parse_doc_path(self.data_prefix(), &path)?
                && id.starts_with(prefix)
            {
                matches.push(blob_id);
            }
        }
        matches
            .par_iter()
            .map(|blob_id| self.parse_blob(blob_id))
            .collect()
    }

    /// All documents whose `_table` field names `table`. Filtering on the
    /// stored field keeps the result correct even if the path encoding is
    /// ever reshaped.
    pub fn list_by_table(&self, table: &str) -> Result<Vec<Document>> {
        self.list_by_table_on(&self.config.default_branch, table)
    }

    pub fn list_by_table_on(&self, branch: &str, table: &str) -> Result<Vec<Document>> {
        let Some(tree) = self.head_tree(branch)? else {
            return Ok(Vec::new());
        };
        let files = self.document_files(&tree)?;
        let docs: Vec<Document> = files
            .par_iter()
            .map(|(_, blob_id)| self.parse_blob(blob_id))
            .collect::<Result<Vec<Document>>>()?;
        Ok(docs
            .into_iter()
            .filter(|doc| doc.table().map(|t| t == table).unwrap_or(false))
            .collect())
    }

    /// The ordered list of commits touching `id`'s path, newest first, each
    /// with the document as of that commit (or a tombstone for a delete).
    pub fn history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        self.history_on(&self.config.default_branch, id)
    }

    pub fn history_on(&self, branch: &str, id: &str) -> Result<Vec<HistoryEntry>> {
        let path = self.doc_path(id)?;
        let Some(head) = self.store.resolve_ref(&DbConfig::branch_ref(branch))? else {
            return Ok(Vec::new());
        };

        // Walk first-parent ancestry, recording the blob at the path per
        // commit; an entry is emitted whenever the blob differs from the
        // parent's.
        let mut revisions: Vec<(Commit, Option<ObjectHash>)> = Vec::new();
        for commit in walk_commits(self.store.as_ref(), head) {
            let commit = commit?;
            let blob = read_path(self.store.as_ref(), &commit.tree_id, &path)?.map(|i| i.id);
            revisions.push((commit, blob));
        }

        let mut entries = Vec::new();
        for (i, (commit, blob)) in revisions.iter().enumerate() {
            let parent_blob = revisions.get(i + 1).and_then(|(_, b)| *b);
            if *blob == parent_blob {
                continue;
            }
            entries.push(HistoryEntry {
                commit_id: commit.id,
                timestamp: commit.committer.timestamp,
                author: commit.author.name.clone(),
                message: commit.format_message(),
                document: match blob {
                    Some(blob_id) => Some(self.parse_blob(blob_id)?),
                    None => None,
                },
            });
        }
        Ok(entries)
    }

    /// The document as of a specific commit, or `None` when the path was
    /// absent at that point in time.
    pub fn get_at(&self, id: &str, commit_id: &ObjectHash) -> Result<Option<Document>> {
        let path = self.doc_path(id)?;
        let commit = self.store.get_commit(commit_id)?;
        match read_path(self.store.as_ref(), &commit.tree_id, &path)? {
            Some(item) => self.parse_blob(&item.id).map(Some),
            None => Ok(None),
        }
    }

    /// Field diff of `id` between two commits. Both commits must contain
    /// the document.
    pub fn diff(&self, id: &str, c1: &ObjectHash, c2: &ObjectHash) -> Result<DocumentDiff> {
        let older = self
            .get_at(id, c1)?
            .ok_or_else(|| ChronError::NotFound(format!("document {id} at commit {c1}")))?;
        let newer = self
            .get_at(id, c2)?
            .ok_or_else(|| ChronError::NotFound(format!("document {id} at commit {c2}")))?;
        Ok(diff_documents(&older, &newer))
    }
}
