//! The database façade: wires the object store, the WAL, crash recovery,
//! the OCC write loop, the search index and the optional upstream sync into
//! the write state machine:
//!
//! validate → WAL append → object insert → ref CAS (OCC) → note append →
//! index update → WAL checkpoint.
//!
//! Failure of the note append or the index update never rolls back the
//! commit; the index catches up in the background.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::admin::{self, BundleStats};
use crate::config::{DbConfig, PushMode};
use crate::document::{Document, DocumentDiff};
use crate::durability::{self, Wal, recover};
use crate::engine::validation::SchemaRule;
use crate::engine::{DocumentEngine, HistoryEntry};
use crate::errors::Result;
use crate::hash::ObjectHash;
use crate::index::{Query, SearchIndex, SearchResults, execute};
use crate::internal::object::signature::{Signature, SignatureType};
use crate::internal::store::{FileStore, MemoryStore, ObjectStore};
use crate::metrics::{Metrics, inc};
use crate::remote::RemoteSync;
use crate::transaction::{self, TxContext};

/// Completed writes between WAL checkpoints.
const CHECKPOINT_INTERVAL: u64 = 256;

pub struct Database {
    store: Arc<dyn ObjectStore>,
    engine: Arc<DocumentEngine>,
    index: Arc<SearchIndex>,
    metrics: Arc<Metrics>,
    wal: Option<Wal>,
    remote: Option<RemoteSync>,
    config: DbConfig,
    writes_since_checkpoint: AtomicU64,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .field(
                "writes_since_checkpoint",
                &self.writes_since_checkpoint.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl Database {
    /// Open (or create) an on-disk database rooted at `root`. Runs stale
    /// lock reclamation, WAL recovery, and the optional startup pull.
    pub fn open(root: impl AsRef<Path>, config: DbConfig) -> Result<Database> {
        let root = root.as_ref();
        let store: Arc<dyn ObjectStore> =
            Arc::new(FileStore::open(root, &config.default_branch)?);
        let wal_dir = config.wal_dir.clone().unwrap_or_else(|| root.join("wal"));
        Database::build(store, Some(wal_dir), config)
    }

    /// An ephemeral database for tests; no WAL, no remote.
    pub fn in_memory(config: DbConfig) -> Result<Database> {
        Database::build(Arc::new(MemoryStore::new()), None, config)
    }

    fn build(
        store: Arc<dyn ObjectStore>,
        wal_dir: Option<PathBuf>,
        config: DbConfig,
    ) -> Result<Database> {
        let engine = Arc::new(DocumentEngine::new(Arc::clone(&store), config.clone()));
        let index = Arc::new(SearchIndex::new(&config)?);
        let metrics = Arc::new(Metrics::new());

        let wal = match (config.wal_enabled, wal_dir) {
            (true, Some(dir)) => Some(Wal::open(dir)?),
            _ => None,
        };
        if let Some(wal) = &wal {
            recover(&engine, &index, wal)?;
        }

        let remote = match &config.remote_dir {
            Some(dir) if config.push_enabled || config.pull_on_start => {
                Some(RemoteSync::open(dir, &config)?)
            }
            _ => None,
        };

        let db = Database {
            store,
            engine,
            index,
            metrics,
            wal,
            remote,
            config,
            writes_since_checkpoint: AtomicU64::new(0),
        };

        if db.config.pull_on_start
            && let Some(remote) = &db.remote
            && let Err(e) = remote.pull_branch(db.store.as_ref(), &db.config.default_branch)
        {
            // Divergence requires external resolution; local state is
            // untouched, so opening proceeds.
            inc(&db.metrics.remote_errors);
            warn!(error = %e, "startup pull failed");
        }
        Ok(db)
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn index(&self) -> &Arc<SearchIndex> {
        &self.index
    }

    /// Register a validation rule for a collection.
    pub fn register_schema(&self, table: impl Into<String>, rule: SchemaRule) {
        self.engine.validators().register(table, rule);
    }

    fn committer(&self) -> Signature {
        Signature::now(
            SignatureType::Committer,
            &self.config.committer_name,
            &self.config.committer_email,
        )
    }

    /// Run `body` with a transaction context bound; every commit inside
    /// carries the context in its note. In batch push mode, deferred
    /// pushes flush when the scope ends.
    pub fn with_transaction<R>(&self, ctx: TxContext, body: impl FnOnce(&Database) -> R) -> R {
        let result = transaction::with_transaction(ctx, || body(self));
        if self.config.push_enabled
            && self.config.push_mode == PushMode::Batch
            && let Some(remote) = &self.remote
        {
            remote.flush(self.store.as_ref(), &self.metrics);
        }
        result
    }

    /// Ensure one transaction context spans the WAL record and the commit
    /// note, so recovery can correlate them.
    fn scoped<R>(&self, body: impl FnOnce() -> R) -> R {
        if transaction::in_scope() {
            body()
        } else {
            transaction::with_transaction(TxContext::system(), body)
        }
    }

    pub fn save(&self, doc: Document) -> Result<Document> {
        self.save_on(&self.config.default_branch.clone(), doc)
    }

    pub fn save_on(&self, branch: &str, doc: Document) -> Result<Document> {
        self.scoped(|| self.save_inner(branch, doc))
    }

    fn save_inner(&self, branch: &str, doc: Document) -> Result<Document> {
        let prepared = doc.with_table()?;
        let id = prepared.id()?.to_string();
        // Validation happens before the WAL sees the record.
        self.engine.validators().validate(&prepared)?;

        let tx = transaction::current();
        if let Some(wal) = &self.wal {
            wal.append_save(&tx.id, branch, &id, prepared.to_canonical_json()?)?;
            inc(&self.metrics.wal_records);
        }

        let (stored, outcome) =
            durability::save_with_occ(&self.engine, &self.metrics, &self.config, branch, prepared)?;
        self.after_write(branch, Some(&stored), &id, outcome.commit_id);
        Ok(stored)
    }

    /// Delete a document; `true` when it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.delete_on(&self.config.default_branch.clone(), id)
    }

    pub fn delete_on(&self, branch: &str, id: &str) -> Result<bool> {
        self.scoped(|| self.delete_inner(branch, id))
    }

    fn delete_inner(&self, branch: &str, id: &str) -> Result<bool> {
        let tx = transaction::current();
        if let Some(wal) = &self.wal {
            wal.append_delete(&tx.id, branch, id)?;
            inc(&self.metrics.wal_records);
        }
        let outcome =
            durability::delete_with_occ(&self.engine, &self.metrics, &self.config, branch, id)?;
        match outcome {
            Some(outcome) => {
                self.after_write(branch, None, id, outcome.commit_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Index update, WAL checkpoint cadence, and push policy for one
    /// completed commit.
    fn after_write(&self, branch: &str, doc: Option<&Document>, id: &str, commit: ObjectHash) {
        let index_result = match doc {
            Some(doc) => self.index.index_document(branch, doc),
            None => {
                self.index.remove(branch, id);
                Ok(())
            }
        };
        match index_result {
            Ok(()) => self.index.set_head(branch, Some(commit)),
            Err(e) => {
                inc(&self.metrics.index_failures);
                self.index.mark_stale(branch);
                SearchIndex::catch_up_background(
                    Arc::clone(&self.index),
                    Arc::clone(&self.engine),
                    branch.to_string(),
                    Arc::clone(&self.metrics),
                );
                warn!(branch, document = id, error = %e, "index update failed; branch marked stale");
            }
        }

        if let Some(wal) = &self.wal {
            let writes = self.writes_since_checkpoint.fetch_add(1, Ordering::Relaxed) + 1;
            if writes >= CHECKPOINT_INTERVAL {
                self.writes_since_checkpoint.store(0, Ordering::Relaxed);
                match wal.checkpoint() {
                    Ok(_) => inc(&self.metrics.wal_checkpoints),
                    Err(e) => warn!(error = %e, "wal checkpoint failed"),
                }
            }
        }

        if self.config.push_enabled
            && let Some(remote) = &self.remote
        {
            match self.config.push_mode {
                PushMode::Sync => remote.push_or_flag(self.store.as_ref(), branch, &self.metrics),
                PushMode::Batch => remote.defer(branch),
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        self.engine.get(id)
    }

    pub fn get_on(&self, branch: &str, id: &str) -> Result<Option<Document>> {
        self.engine.get_on(branch, id)
    }

    pub fn list_by_prefix(&self, prefix: &str) -> Result<Vec<Document>> {
        self.engine.list_by_prefix(prefix)
    }

    pub fn list_by_prefix_on(&self, branch: &str, prefix: &str) -> Result<Vec<Document>> {
        self.engine.list_by_prefix_on(branch, prefix)
    }

    pub fn list_by_table(&self, table: &str) -> Result<Vec<Document>> {
        self.engine.list_by_table(table)
    }

    pub fn list_by_table_on(&self, branch: &str, table: &str) -> Result<Vec<Document>> {
        self.engine.list_by_table_on(branch, table)
    }

    pub fn history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        self.engine.history(id)
    }

    pub fn history_on(&self, branch: &str, id: &str) -> Result<Vec<HistoryEntry>> {
        self.engine.history_on(branch, id)
    }

    pub fn get_at(&self, id: &str, commit: &ObjectHash) -> Result<Option<Document>> {
        self.engine.get_at(id, commit)
    }

    pub fn diff(&self, id: &str, c1: &ObjectHash, c2: &ObjectHash) -> Result<DocumentDiff> {
        self.engine.diff(id, c1, c2)
    }

    /// Execute a query AST against the index, returning matching ids and a
    /// continuation cursor.
    pub fn search(&self, query: &Query) -> Result<SearchResults> {
        execute(&self.index, &self.engine, query)
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        admin::list_branches(self.store.as_ref())
    }

    pub fn create_branch(&self, name: &str, from: Option<&str>) -> Result<()> {
        let from = self.config.branch_or_default(from);
        admin::create_branch(self.store.as_ref(), name, from)
    }

    pub fn checkout(&self, name: &str) -> Result<()> {
        admin::checkout(self.store.as_ref(), name)
    }

    /// Best-effort three-way merge of `theirs` into `ours`.
    pub fn merge(&self, ours: &str, theirs: &str) -> Result<ObjectHash> {
        let commit = admin::merge(self.store.as_ref(), ours, theirs, &self.committer())?;
        self.index.mark_stale(ours);
        SearchIndex::catch_up_background(
            Arc::clone(&self.index),
            Arc::clone(&self.engine),
            ours.to_string(),
            Arc::clone(&self.metrics),
        );
        Ok(commit)
    }

    pub fn export_bundle(&self, path: &Path) -> Result<BundleStats> {
        admin::export_bundle(self.store.as_ref(), path)
    }

    pub fn import_bundle(&self, path: &Path) -> Result<BundleStats> {
        let stats = admin::import_bundle(self.store.as_ref(), path)?;
        for branch in self.list_branches()? {
            self.index.mark_stale(&branch);
        }
        Ok(stats)
    }

    pub fn backup(&self, path: &Path) -> Result<BundleStats> {
        self.export_bundle(path)
    }

    pub fn restore(&self, path: &Path) -> Result<BundleStats> {
        self.import_bundle(path)
    }

    /// Push every branch flagged "needs push".
    pub fn flush_pushes(&self) {
        if let Some(remote) = &self.remote {
            remote.flush(self.store.as_ref(), &self.metrics);
        }
    }

    /// Block until background index work drains; tests and shutdown.
    pub fn wait_for_index(&self) {
        self.index.wait_idle();
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.config.push_enabled {
            self.flush_pushes();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, set_hash_kind_scoped};
    use crate::index::Clause;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_value(v).unwrap()
    }

    #[test]
    fn test_in_memory_save_get_search() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let db = Database::in_memory(DbConfig::default()).unwrap();
        db.save(doc(json!({"id": "user:1", "name": "Alice"}))).unwrap();

        let fetched = db.get("user:1").unwrap().unwrap();
        assert_eq!(fetched.get("name"), Some(&json!("Alice")));

        let results = db
            .search(&Query::new(Clause::term("id", "user:1")))
            .unwrap();
        assert_eq!(results.ids, vec!["user:1"]);
    }

    #[test]
    fn test_index_follows_delete() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let db = Database::in_memory(DbConfig::default()).unwrap();
        db.save(doc(json!({"id": "user:1", "name": "Alice"}))).unwrap();
        assert!(db.delete("user:1").unwrap());
        assert!(!db.delete("user:1").unwrap());

        let results = db
            .search(&Query::new(Clause::term("id", "user:1")))
            .unwrap();
        assert!(results.ids.is_empty());
    }

    #[test]
    fn test_transaction_note_carries_context() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let db = Database::in_memory(DbConfig::default()).unwrap();
        let ctx = TxContext::new(crate::transaction::Origin::Rest).with_user("alice");
        db.with_transaction(ctx, |db| {
            db.save(doc(json!({"id": "user:1", "name": "Alice"}))).unwrap();
        });

        let head = db.store().resolve_ref("refs/heads/main").unwrap().unwrap();
        let note = crate::internal::pipeline::read_note(db.store().as_ref(), &head)
            .unwrap()
            .unwrap();
        let payload = note.payload().unwrap();
        assert_eq!(payload["origin"], "rest");
        assert_eq!(payload["user"], "alice");
        assert_eq!(payload["operation"], "save");
    }

    #[test]
    fn test_index_watermark_tracks_head() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let db = Database::in_memory(DbConfig::default()).unwrap();
        db.save(doc(json!({"id": "a:1"}))).unwrap();
        let head = db.store().resolve_ref("refs/heads/main").unwrap();
        assert_eq!(db.index().head("main"), head);
    }
}
