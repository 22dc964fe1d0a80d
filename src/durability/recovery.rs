//! Crash recovery: replay the WAL so that storage and index reflect every
//! completed transaction and nothing of any incomplete one.
//!
//! Decision rule, per pending record: resolve the record's branch head and
//! scan its ancestry for a commit whose note carries the record's
//! transaction id. Found — the commit landed before the crash, so only the
//! index effect is re-applied. Not found — the operation is re-applied
//! idempotently through the engine (saves are whole-document overwrites,
//! deletes of a missing path are no-ops). A corrupt record has already
//! halted the scan by the time this module runs.

use tracing::{info, warn};

use crate::config::DbConfig;
use crate::document::Document;
use crate::durability::wal::{Wal, WalRecord};
use crate::engine::DocumentEngine;
use crate::errors::Result;
use crate::hash::ObjectHash;
use crate::index::SearchIndex;
use crate::internal::pipeline::read_note;
use crate::internal::store::{ObjectStore, walk_commits};
use crate::transaction::{self, Origin, TxContext};

/// Context for re-applying a record: carries the record's original
/// transaction id, so the produced note lets a later recovery recognize
/// the operation as landed.
fn replay_ctx(tx_id: &str) -> TxContext {
    let mut ctx = TxContext::new(Origin::System).with_flag("recovery");
    ctx.id = tx_id.to_string();
    ctx
}

/// Ancestry window scanned when matching a record to a landed commit. A
/// pending record is always near the head, so a bounded scan suffices.
const ANCESTRY_SCAN_LIMIT: usize = 512;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records whose commit landed; only the index was caught up.
    pub reindexed: usize,
    /// Records re-applied through the engine.
    pub replayed: usize,
    /// Torn records discarded from the tail of the newest segment.
    pub discarded: usize,
}

fn find_commit_for_tx(
    store: &dyn ObjectStore,
    branch: &str,
    tx_id: &str,
) -> Result<Option<ObjectHash>> {
    let Some(head) = store.resolve_ref(&DbConfig::branch_ref(branch))? else {
        return Ok(None);
    };
    for commit in walk_commits(store, head).take(ANCESTRY_SCAN_LIMIT) {
        let commit = commit?;
        if let Some(note) = read_note(store, &commit.id)?
            && let Ok(payload) = note.payload()
            && payload.get("tx_id").and_then(|v| v.as_str()) == Some(tx_id)
        {
            return Ok(Some(commit.id));
        }
    }
    Ok(None)
}

/// Replay the WAL against storage and index, then checkpoint.
pub fn recover(engine: &DocumentEngine, index: &SearchIndex, wal: &Wal) -> Result<RecoveryReport> {
    let scan = wal.scan()?;
    let mut report = RecoveryReport {
        discarded: scan.torn,
        ..RecoveryReport::default()
    };
    let mut touched_branches: Vec<String> = Vec::new();

    for record in scan.pending() {
        match record {
            WalRecord::Save {
                tx_id,
                branch,
                document_id,
                payload,
                ..
            } => {
                let text = String::from_utf8_lossy(payload);
                let doc = Document::from_json(&text)?;
                if find_commit_for_tx(engine.store().as_ref(), branch, tx_id)?.is_some() {
                    index.index_document(branch, &doc)?;
                    report.reindexed += 1;
                } else {
                    info!(document = %document_id, branch, "replaying save from wal");
                    let (stored, _) = transaction::with_transaction(replay_ctx(tx_id), || {
                        engine.save_on(branch, doc)
                    })?;
                    index.index_document(branch, &stored)?;
                    report.replayed += 1;
                }
                touched_branches.push(branch.clone());
            }
            WalRecord::Delete {
                tx_id,
                branch,
                document_id,
                ..
            } => {
                if find_commit_for_tx(engine.store().as_ref(), branch, tx_id)?.is_some() {
                    index.remove(branch, document_id);
                    report.reindexed += 1;
                } else {
                    info!(document = %document_id, branch, "replaying delete from wal");
                    transaction::with_transaction(replay_ctx(tx_id), || {
                        engine.delete_on(branch, document_id)
                    })?;
                    index.remove(branch, document_id);
                    report.replayed += 1;
                }
                touched_branches.push(branch.clone());
            }
            WalRecord::Checkpoint { .. } => {}
        }
    }

    // Re-align the index watermark with the storage head of every branch
    // the replay touched.
    touched_branches.sort();
    touched_branches.dedup();
    for branch in &touched_branches {
        let head = engine
            .store()
            .resolve_ref(&DbConfig::branch_ref(branch))?;
        index.set_head(branch, head);
    }

    if report.reindexed + report.replayed + report.discarded > 0 {
        warn!(?report, "wal recovery applied work");
    }
    wal.checkpoint()?;
    Ok(report)
}
