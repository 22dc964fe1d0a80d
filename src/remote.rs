//! Store-to-store sync with an upstream bare repository directory. Push is
//! last-writer-wins with force semantics: a diverged upstream ref is
//! overwritten, and this guarantee is deliberately not strengthened —
//! applications needing more use branch-per-node or external locking.
//! A failed push never fails the local operation; the branch is flagged
//! "needs push" and retried on the next opportunity.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, warn};

use crate::config::DbConfig;
use crate::errors::{ChronError, Result};
use crate::hash::ObjectHash;
use crate::internal::object::commit::Commit;
use crate::internal::object::tree::Tree;
use crate::internal::object::types::ObjectType;
use crate::internal::object::ObjectTrait;
use crate::internal::store::{FileStore, ObjectStore, RefTransition};
use crate::metrics::{Metrics, inc};

/// Copy every object reachable from `tip` that `dst` is missing. Pruning on
/// `has_object` keeps incremental pushes proportional to the new commits.
fn copy_reachable(
    src: &dyn ObjectStore,
    dst: &dyn ObjectStore,
    tip: ObjectHash,
) -> Result<usize> {
    let mut copied = 0;
    let mut stack = vec![tip];
    while let Some(id) = stack.pop() {
        if dst.has_object(&id)? {
            continue;
        }
        let (ty, data) = src
            .get_raw(&id)?
            .ok_or_else(|| ChronError::NotFound(format!("object {id}")))?;
        match ty {
            ObjectType::Commit => {
                let commit = Commit::from_bytes(&data, id)?;
                stack.push(commit.tree_id);
                stack.extend(commit.parent_commit_ids.iter().copied());
            }
            ObjectType::Tree => {
                let tree = Tree::from_bytes(&data, id)?;
                stack.extend(tree.tree_items.iter().map(|i| i.id));
            }
            ObjectType::Blob => {}
        }
        dst.put_raw(ty, &data)?;
        copied += 1;
    }
    Ok(copied)
}

pub struct RemoteSync {
    upstream: Arc<dyn ObjectStore>,
    push_notes: bool,
    needs_push: DashSet<String>,
}

impl RemoteSync {
    /// Open the upstream bare directory.
    pub fn open(dir: &Path, config: &DbConfig) -> Result<RemoteSync> {
        let upstream = FileStore::open(dir, &config.default_branch)?;
        Ok(RemoteSync {
            upstream: Arc::new(upstream),
            push_notes: config.push_notes,
            needs_push: DashSet::new(),
        })
    }

    /// Test constructor over any store.
    pub fn over(upstream: Arc<dyn ObjectStore>, push_notes: bool) -> RemoteSync {
        RemoteSync {
            upstream,
            push_notes,
            needs_push: DashSet::new(),
        }
    }

    pub fn needs_push(&self, branch: &str) -> bool {
        self.needs_push.contains(branch)
    }

    /// Push one branch: copy missing objects, then move the upstream ref.
    /// A diverged upstream is overwritten (`Forced`).
    pub fn push_branch(
        &self,
        local: &dyn ObjectStore,
        branch: &str,
    ) -> Result<RefTransition> {
        let ref_name = DbConfig::branch_ref(branch);
        let head = local
            .resolve_ref(&ref_name)?
            .ok_or_else(|| ChronError::NotFound(format!("branch {branch}")))?;
        copy_reachable(local, self.upstream.as_ref(), head)?;
        let current = self.upstream.resolve_ref(&ref_name)?;
        let transition = self
            .upstream
            .update_ref(&ref_name, current.as_ref(), &head, true)?;
        if transition == RefTransition::Forced {
            warn!(branch, "push overwrote a diverged upstream (last writer wins)");
        }
        if self.push_notes
            && let Some(notes_head) = local.resolve_ref(DbConfig::NOTES_REF)?
        {
            copy_reachable(local, self.upstream.as_ref(), notes_head)?;
            let current = self.upstream.resolve_ref(DbConfig::NOTES_REF)?;
            self.upstream
                .update_ref(DbConfig::NOTES_REF, current.as_ref(), &notes_head, true)?;
        }
        debug!(branch, head = %head, "pushed");
        Ok(transition)
    }

    /// Push and absorb failure: errors are logged and counted, and the
    /// branch is flagged for a later retry.
    pub fn push_or_flag(&self, local: &dyn ObjectStore, branch: &str, metrics: &Metrics) {
        match self.push_branch(local, branch) {
            Ok(_) => {
                inc(&metrics.remote_pushes);
                self.needs_push.remove(branch);
            }
            Err(e) => {
                inc(&metrics.remote_errors);
                self.needs_push.insert(branch.to_string());
                warn!(branch, error = %e, "push failed; branch flagged needs-push");
            }
        }
    }

    /// Defer a push until the end of the current scope (batch mode).
    pub fn defer(&self, branch: &str) {
        self.needs_push.insert(branch.to_string());
    }

    /// Push every flagged branch; called at scope end and shutdown.
    pub fn flush(&self, local: &dyn ObjectStore, metrics: &Metrics) {
        let branches: Vec<String> = self.needs_push.iter().map(|b| b.key().clone()).collect();
        for branch in branches {
            self.push_or_flag(local, &branch, metrics);
        }
    }

    /// Fetch one branch and fast-forward the local ref. A diverged local
    /// branch is a conflict requiring external resolution.
    pub fn pull_branch(
        &self,
        local: &dyn ObjectStore,
        branch: &str,
    ) -> Result<Option<RefTransition>> {
        let ref_name = DbConfig::branch_ref(branch);
        let Some(upstream_head) = self.upstream.resolve_ref(&ref_name)? else {
            return Ok(None);
        };
        copy_reachable(self.upstream.as_ref(), local, upstream_head)?;
        if self.push_notes
            && let Some(notes_head) = self.upstream.resolve_ref(DbConfig::NOTES_REF)?
        {
            copy_reachable(self.upstream.as_ref(), local, notes_head)?;
            let current = local.resolve_ref(DbConfig::NOTES_REF)?;
            local.update_ref(DbConfig::NOTES_REF, current.as_ref(), &notes_head, true)?;
        }

        let local_head = local.resolve_ref(&ref_name)?;
        match local_head {
            None => {
                let t = local.update_ref(&ref_name, None, &upstream_head, false)?;
                Ok(Some(t))
            }
            Some(current) if current == upstream_head => Ok(Some(RefTransition::FastForwarded)),
            Some(current) => {
                // Fast-forward only when the local head is an ancestor of
                // the upstream head.
                let mut cursor = Some(upstream_head);
                while let Some(id) = cursor {
                    if id == current {
                        let t = local.update_ref(
                            &ref_name,
                            Some(&current),
                            &upstream_head,
                            false,
                        )?;
                        return Ok(Some(t));
                    }
                    cursor = local.get_commit(&id)?.first_parent().copied();
                }
                Err(ChronError::Conflict {
                    subject: branch.to_string(),
                    branch: branch.to_string(),
                    detail: "local and upstream histories diverged".to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbConfig;
    use crate::document::Document;
    use crate::engine::DocumentEngine;
    use crate::hash::{HashKind, set_hash_kind_scoped};
    use crate::internal::store::MemoryStore;
    use serde_json::json;

    fn engine_over(store: Arc<dyn ObjectStore>) -> DocumentEngine {
        DocumentEngine::new(store, DbConfig::default())
    }

    fn doc(v: serde_json::Value) -> Document {
        Document::from_value(v).unwrap()
    }

    #[test]
    fn test_push_then_pull_round_trip() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let local: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let upstream: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let engine = engine_over(Arc::clone(&local));
        engine.save(doc(json!({"id": "a:1", "v": 1}))).unwrap();

        let remote = RemoteSync::over(Arc::clone(&upstream), true);
        let t = remote.push_branch(local.as_ref(), "main").unwrap();
        assert_eq!(t, RefTransition::Created);
        assert_eq!(
            upstream.resolve_ref("refs/heads/main").unwrap(),
            local.resolve_ref("refs/heads/main").unwrap()
        );
        // Notes came along.
        assert!(upstream.resolve_ref(DbConfig::NOTES_REF).unwrap().is_some());

        // A fresh replica pulls everything back.
        let replica: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let remote_for_replica = RemoteSync::over(Arc::clone(&upstream), true);
        remote_for_replica
            .pull_branch(replica.as_ref(), "main")
            .unwrap()
            .unwrap();
        let replica_engine = engine_over(Arc::clone(&replica));
        assert!(replica_engine.get("a:1").unwrap().is_some());
    }

    #[test]
    fn test_push_forces_on_divergence() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let local: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let upstream: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        engine_over(Arc::clone(&local))
            .save(doc(json!({"id": "a:1", "side": "local"})))
            .unwrap();
        engine_over(Arc::clone(&upstream))
            .save(doc(json!({"id": "a:1", "side": "upstream"})))
            .unwrap();

        let remote = RemoteSync::over(Arc::clone(&upstream), false);
        let t = remote.push_branch(local.as_ref(), "main").unwrap();
        assert_eq!(t, RefTransition::Forced);
        assert_eq!(
            upstream.resolve_ref("refs/heads/main").unwrap(),
            local.resolve_ref("refs/heads/main").unwrap()
        );
    }

    #[test]
    fn test_pull_divergence_is_conflict() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let local: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let upstream: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        engine_over(Arc::clone(&local))
            .save(doc(json!({"id": "a:1", "side": "local"})))
            .unwrap();
        engine_over(Arc::clone(&upstream))
            .save(doc(json!({"id": "a:1", "side": "upstream"})))
            .unwrap();

        let remote = RemoteSync::over(Arc::clone(&upstream), false);
        let err = remote.pull_branch(local.as_ref(), "main").unwrap_err();
        assert!(err.is_conflict());
        // Local state is untouched.
        let engine = engine_over(Arc::clone(&local));
        assert_eq!(
            engine.get("a:1").unwrap().unwrap().get("side"),
            Some(&json!("local"))
        );
    }

    #[test]
    fn test_failed_push_flags_branch() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let local: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let upstream: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let metrics = Metrics::new();
        let remote = RemoteSync::over(Arc::clone(&upstream), false);

        // Pushing a branch that does not exist locally fails and flags.
        remote.push_or_flag(local.as_ref(), "main", &metrics);
        assert!(remote.needs_push("main"));
        assert_eq!(crate::metrics::get(&metrics.remote_errors), 1);

        // Once the branch exists, flush clears the flag.
        engine_over(Arc::clone(&local))
            .save(doc(json!({"id": "a:1"})))
            .unwrap();
        remote.flush(local.as_ref(), &metrics);
        assert!(!remote.needs_push("main"));
        assert_eq!(crate::metrics::get(&metrics.remote_pushes), 1);
    }
}
