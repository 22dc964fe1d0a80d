//! Transaction context: per-operation metadata recorded as a note on every
//! commit produced within a scope. The scope is bound thread-locally — a
//! guard restores the previous scope on every exit path — and nested scopes
//! inherit and may extend the parent's metadata.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Which front-end produced an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Rest,
    Redis,
    Sql,
    System,
    Other(String),
}

impl Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Rest => write!(f, "rest"),
            Origin::Redis => write!(f, "redis"),
            Origin::Sql => write!(f, "sql"),
            Origin::System => write!(f, "system"),
            Origin::Other(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for Origin {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "rest" => Origin::Rest,
            "redis" => Origin::Redis,
            "sql" => Origin::Sql,
            "system" => Origin::System,
            other => Origin::Other(other.to_string()),
        })
    }
}

/// Metadata attached to every commit produced inside a scope.
#[derive(Debug, Clone)]
pub struct TxContext {
    /// Unique id; concurrent writers always observe distinct values.
    pub id: String,
    pub origin: Origin,
    pub user: Option<String>,
    /// Short markers such as `delete`, `update`, `bulk-load`, `migration`.
    pub flags: BTreeSet<String>,
    /// Free-form JSON map: branch, client request id, remote address, etc.
    pub metadata: Map<String, Value>,
}

impl TxContext {
    pub fn new(origin: Origin) -> TxContext {
        TxContext {
            id: Uuid::now_v7().to_string(),
            origin,
            user: None,
            flags: BTreeSet::new(),
            metadata: Map::new(),
        }
    }

    /// Context used when no scope is bound: a fresh system transaction.
    pub fn system() -> TxContext {
        TxContext::new(Origin::System)
    }

    pub fn with_user(mut self, user: impl Into<String>) -> TxContext {
        self.user = Some(user.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> TxContext {
        self.flags.insert(flag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> TxContext {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The note payload for one commit produced under this context.
    pub fn note_payload(&self, operation: &str, document_id: &str, branch: &str) -> Value {
        let mut payload = json!({
            "tx_id": self.id,
            "origin": self.origin.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "operation": operation,
            "document_id": document_id,
            "branch": branch,
        });
        let map = payload.as_object_mut().expect("payload is an object");
        if let Some(user) = &self.user {
            map.insert("user".to_string(), json!(user));
        }
        if !self.flags.is_empty() {
            map.insert("flags".to_string(), json!(self.flags));
        }
        if !self.metadata.is_empty() {
            map.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
        }
        payload
    }
}

thread_local! {
    static CURRENT_TX: RefCell<Vec<TxContext>> = const { RefCell::new(Vec::new()) };
}

/// Guard that unbinds the innermost scope when dropped.
pub struct TxGuard {
    _private: (),
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        CURRENT_TX.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Bind `ctx` as the innermost transaction scope and return a guard. A
/// nested scope inherits the parent's metadata; its own entries win on key
/// collisions.
pub fn bind(mut ctx: TxContext) -> TxGuard {
    CURRENT_TX.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(parent) = stack.last() {
            let mut merged = parent.metadata.clone();
            merged.extend(std::mem::take(&mut ctx.metadata));
            ctx.metadata = merged;
        }
        stack.push(ctx);
    });
    TxGuard { _private: () }
}

/// Run `body` with `ctx` bound; every commit produced inside carries the
/// context in its note payload.
pub fn with_transaction<R>(ctx: TxContext, body: impl FnOnce() -> R) -> R {
    let _guard = bind(ctx);
    body()
}

/// The innermost bound context, or a fresh system context when none is
/// bound. Unscoped writes therefore still get a distinct transaction id.
pub fn current() -> TxContext {
    CURRENT_TX.with(|stack| stack.borrow().last().cloned())
        .unwrap_or_else(TxContext::system)
}

/// Whether a scope is currently bound; batch push mode keys off this.
pub fn in_scope() -> bool {
    CURRENT_TX.with(|stack| !stack.borrow().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unscoped_writes_get_fresh_system_context() {
        let a = current();
        let b = current();
        assert_eq!(a.origin, Origin::System);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_scope_binds_and_restores() {
        assert!(!in_scope());
        let outer_id = with_transaction(TxContext::new(Origin::Rest), || {
            assert!(in_scope());
            current().id
        });
        assert!(!in_scope());
        assert_ne!(outer_id, current().id);
    }

    #[test]
    fn test_nested_scope_inherits_metadata() {
        let ctx = TxContext::new(Origin::Sql).with_metadata("request_id", serde_json::json!("r-1"));
        with_transaction(ctx, || {
            let nested =
                TxContext::new(Origin::Sql).with_metadata("statement", serde_json::json!("update"));
            with_transaction(nested, || {
                let cur = current();
                assert_eq!(cur.metadata.get("request_id"), Some(&serde_json::json!("r-1")));
                assert_eq!(cur.metadata.get("statement"), Some(&serde_json::json!("update")));
            });
            // Back in the outer scope the extension is gone.
            assert!(current().metadata.get("statement").is_none());
        });
    }

    #[test]
    fn test_note_payload_shape() {
        let ctx = TxContext::new(Origin::Redis)
            .with_user("alice")
            .with_flag("update");
        let payload = ctx.note_payload("save", "user:1", "main");
        assert_eq!(payload["origin"], "redis");
        assert_eq!(payload["operation"], "save");
        assert_eq!(payload["document_id"], "user:1");
        assert_eq!(payload["branch"], "main");
        assert_eq!(payload["user"], "alice");
        assert_eq!(payload["flags"][0], "update");
        assert_eq!(payload["tx_id"], ctx.id);
    }

    #[test]
    fn test_concurrent_scopes_have_distinct_ids() {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                std::thread::spawn(|| with_transaction(TxContext::system(), || current().id))
            })
            .collect();
        let mut ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }
}
