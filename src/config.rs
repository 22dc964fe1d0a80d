//! Database configuration, constructed at startup and threaded explicitly
//! through constructors. There is no ambient global configuration state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How commits are propagated to the configured upstream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PushMode {
    /// Push after every commit.
    #[default]
    Sync,
    /// Defer pushes until a transaction scope ends.
    Batch,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DbConfig {
    /// Branch used when the caller does not specify one.
    pub default_branch: String,
    /// Identity recorded on every commit.
    pub committer_name: String,
    pub committer_email: String,
    /// If true, attempt an upstream push after each commit.
    pub push_enabled: bool,
    /// If true, include the notes ref in push/fetch.
    pub push_notes: bool,
    pub push_mode: PushMode,
    /// Fetch and fast-forward from the upstream at init.
    pub pull_on_start: bool,
    /// Bare repository directory of the upstream, when sync is configured.
    pub remote_dir: Option<PathBuf>,
    /// Optional tree prefix under which document directories live.
    pub data_dir: Option<String>,
    pub wal_enabled: bool,
    /// WAL segment directory; defaults to `<repository>/wal`.
    pub wal_dir: Option<PathBuf>,
    /// Directory holding the index `write.lock`; in-memory index otherwise.
    pub index_dir: Option<PathBuf>,
    pub occ_enabled: bool,
    pub occ_max_retries: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            committer_name: "chrondb".to_string(),
            committer_email: "chrondb@localhost".to_string(),
            push_enabled: false,
            push_notes: true,
            push_mode: PushMode::default(),
            pull_on_start: false,
            remote_dir: None,
            data_dir: None,
            wal_enabled: true,
            wal_dir: None,
            index_dir: None,
            occ_enabled: true,
            occ_max_retries: 5,
        }
    }
}

impl DbConfig {
    /// Ref name for a branch, e.g. `refs/heads/main`.
    pub fn branch_ref(branch: &str) -> String {
        format!("refs/heads/{branch}")
    }

    /// The dedicated notes ref carrying per-commit transaction metadata.
    pub const NOTES_REF: &'static str = "refs/notes/chrondb";

    /// Branch to operate on when the caller passed none.
    pub fn branch_or_default<'a>(&'a self, branch: Option<&'a str>) -> &'a str {
        branch.unwrap_or(&self.default_branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = DbConfig::default();
        assert_eq!(cfg.default_branch, "main");
        assert!(cfg.wal_enabled);
        assert!(cfg.occ_enabled);
        assert_eq!(cfg.occ_max_retries, 5);
        assert_eq!(cfg.push_mode, PushMode::Sync);
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let cfg: DbConfig =
            serde_json::from_str(r#"{"default_branch":"dev","occ_max_retries":9}"#).unwrap();
        assert_eq!(cfg.default_branch, "dev");
        assert_eq!(cfg.occ_max_retries, 9);
        assert_eq!(cfg.committer_name, "chrondb");
    }

    #[test]
    fn test_branch_ref_naming() {
        assert_eq!(DbConfig::branch_ref("main"), "refs/heads/main");
        let cfg = DbConfig::default();
        assert_eq!(cfg.branch_or_default(None), "main");
        assert_eq!(cfg.branch_or_default(Some("dev")), "dev");
    }
}
