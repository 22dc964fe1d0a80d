//! The durability layer: write-ahead logging, crash recovery, and the
//! optimistic concurrency control loop that wraps the single-shot engine.
pub mod recovery;
pub mod wal;

pub use recovery::{RecoveryReport, recover};
pub use wal::{Wal, WalRecord, WalScan};

use crate::config::DbConfig;
use crate::document::Document;
use crate::engine::DocumentEngine;
use crate::errors::Result;
use crate::internal::pipeline::CommitOutcome;
use crate::metrics::{Metrics, inc};

/// Run `save` under the OCC policy: on a CAS rejection the write reloads
/// the head and retries up to `occ_max_retries` before surfacing
/// `Conflict`. Each save attempt rebuilds the commit against the freshly
/// observed head, so the retried write is a clean overwrite.
pub fn save_with_occ(
    engine: &DocumentEngine,
    metrics: &Metrics,
    config: &DbConfig,
    branch: &str,
    doc: Document,
) -> Result<(Document, CommitOutcome)> {
    let budget = if config.occ_enabled {
        config.occ_max_retries
    } else {
        0
    };
    let mut attempt = 0;
    loop {
        match engine.save_on(branch, doc.clone()) {
            Err(e) if e.is_conflict() && attempt < budget => {
                inc(&metrics.occ_conflicts);
                inc(&metrics.occ_retries);
                attempt += 1;
            }
            Err(e) if e.is_conflict() => {
                inc(&metrics.occ_conflicts);
                return Err(e);
            }
            other => return other,
        }
    }
}

/// OCC wrapper for deletes; same retry discipline as [`save_with_occ`].
pub fn delete_with_occ(
    engine: &DocumentEngine,
    metrics: &Metrics,
    config: &DbConfig,
    branch: &str,
    id: &str,
) -> Result<Option<CommitOutcome>> {
    let budget = if config.occ_enabled {
        config.occ_max_retries
    } else {
        0
    };
    let mut attempt = 0;
    loop {
        match engine.delete_on(branch, id) {
            Err(e) if e.is_conflict() && attempt < budget => {
                inc(&metrics.occ_conflicts);
                inc(&metrics.occ_retries);
                attempt += 1;
            }
            Err(e) if e.is_conflict() => {
                inc(&metrics.occ_conflicts);
                return Err(e);
            }
            other => return other,
        }
    }
}
