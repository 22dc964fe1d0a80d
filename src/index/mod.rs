//! Near-real-time search index mirroring the commit stream, one entry per
//! (branch, document id). Ingestion happens on every successful write; if
//! an index update is skipped or fails, the branch is flagged stale and a
//! background catch-up walks the branch head and re-applies documents.
//!
//! Field modes:
//! - *keyword*: `id`, `_table`, and any scalar non-text value — exact match
//!   and sorting.
//! - *text*: string fields — tokenized, case-folded, accent-stripped.
//! - *fts*: fields whose name ends in `_fts` — same tokens, but queried
//!   with prefix/wildcard semantics.
pub mod executor;
pub mod query;
pub mod tokenizer;

pub use executor::{SearchResults, execute};
pub use query::{Clause, Query, SortOrder, SortSpec};

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use dashmap::DashMap;
use serde_json::Value;
use threadpool::ThreadPool;
use tracing::{debug, warn};

use crate::config::DbConfig;
use crate::document::Document;
use crate::engine::DocumentEngine;
use crate::errors::Result;
use crate::hash::{ObjectHash, get_hash_kind, set_hash_kind_scoped};
use crate::metrics::{Metrics, inc};
use crate::utils::{LockFile, reclaim_stale_locks};

/// Suffix selecting the fts field mode.
pub const FTS_SUFFIX: &str = "_fts";

/// One indexed document: raw field values for keyword matching and sorting,
/// plus token lists for the two text modes.
#[derive(Debug, Clone, Default)]
pub struct IndexedDoc {
    pub values: AHashMap<String, Value>,
    pub text: AHashMap<String, Vec<String>>,
    pub fts: AHashMap<String, Vec<String>>,
}

impl IndexedDoc {
    pub fn from_document(doc: &Document) -> IndexedDoc {
        let mut indexed = IndexedDoc::default();
        for (field, value) in doc.fields() {
            indexed.values.insert(field.clone(), value.clone());
            if let Value::String(text) = value {
                let tokens = tokenizer::tokenize(text);
                if field.ends_with(FTS_SUFFIX) {
                    indexed.fts.insert(field.clone(), tokens);
                } else {
                    indexed.text.insert(field.clone(), tokens);
                }
            }
        }
        indexed
    }
}

/// Index state of one branch.
#[derive(Default)]
pub struct BranchIndex {
    pub(crate) docs: DashMap<String, IndexedDoc>,
    stale: AtomicBool,
    /// Commit the index has caught up to; `None` before the first write.
    head: Mutex<Option<ObjectHash>>,
}

impl BranchIndex {
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

pub struct SearchIndex {
    branches: DashMap<String, Arc<BranchIndex>>,
    pool: ThreadPool,
    _write_lock: Option<LockFile>,
}

impl SearchIndex {
    /// Build the index. When an index directory is configured, a
    /// `write.lock` inside it makes this the exclusive writer; the lock is
    /// removed on shutdown and reclaimed on startup.
    pub fn new(config: &DbConfig) -> Result<SearchIndex> {
        let write_lock = match &config.index_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                reclaim_stale_locks(dir)?;
                Some(LockFile::try_acquire(&dir.join("write"))?)
            }
            None => None,
        };
        Ok(SearchIndex {
            branches: DashMap::new(),
            pool: ThreadPool::new(num_cpus::get().max(1)),
            _write_lock: write_lock,
        })
    }

    pub(crate) fn branch(&self, branch: &str) -> Arc<BranchIndex> {
        self.branches
            .entry(branch.to_string())
            .or_default()
            .clone()
    }

    /// Mirror one write into the index.
    pub fn index_document(&self, branch: &str, doc: &Document) -> Result<()> {
        let id = doc.id()?.to_string();
        self.branch(branch)
            .docs
            .insert(id, IndexedDoc::from_document(doc));
        Ok(())
    }

    /// Mirror one delete into the index.
    pub fn remove(&self, branch: &str, id: &str) {
        if let Some(entry) = self.branches.get(branch) {
            entry.docs.remove(id);
        }
    }

    /// Record that the index no longer mirrors `branch`.
    pub fn mark_stale(&self, branch: &str) {
        self.branch(branch).stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self, branch: &str) -> bool {
        self.branch(branch).stale.load(Ordering::Acquire)
    }

    /// Move the per-branch watermark. `None` clears it (branch deleted).
    pub fn set_head(&self, branch: &str, head: Option<ObjectHash>) {
        *self.branch(branch).head.lock().unwrap() = head;
    }

    pub fn head(&self, branch: &str) -> Option<ObjectHash> {
        *self.branch(branch).head.lock().unwrap()
    }

    /// Rebuild the branch entry from the storage head, synchronously.
    /// Clears the stale flag and re-aligns the watermark.
    pub fn catch_up(&self, engine: &DocumentEngine, branch: &str) -> Result<usize> {
        let head = engine
            .store()
            .resolve_ref(&DbConfig::branch_ref(branch))?;
        let docs = engine.list_by_prefix_on(branch, "")?;
        let entry = self.branch(branch);
        entry.docs.clear();
        let count = docs.len();
        for doc in docs {
            let id = doc.id()?.to_string();
            entry.docs.insert(id, IndexedDoc::from_document(&doc));
        }
        *entry.head.lock().unwrap() = head;
        entry.stale.store(false, Ordering::Release);
        debug!(branch, count, "index caught up from storage");
        Ok(count)
    }

    /// Queue a catch-up walk on the worker pool. Failures leave the branch
    /// stale for the next attempt.
    pub fn catch_up_background(
        index: Arc<SearchIndex>,
        engine: Arc<DocumentEngine>,
        branch: String,
        metrics: Arc<Metrics>,
    ) {
        let kind = get_hash_kind();
        let pool = index.pool.clone();
        pool.execute(move || {
            let _guard = set_hash_kind_scoped(kind);
            match index.catch_up(&engine, &branch) {
                Ok(count) => {
                    inc(&metrics.index_catchups);
                    debug!(branch, count, "background index catch-up finished");
                }
                Err(e) => {
                    inc(&metrics.index_failures);
                    warn!(branch, error = %e, "background index catch-up failed");
                }
            }
        });
    }

    /// Block until queued catch-up work drains; used by tests and shutdown.
    pub fn wait_idle(&self) {
        self.pool.join();
    }
}
