//! The query AST: the language-neutral representation every front-end
//! protocol lowers into and the index executor consumes. Clauses are a
//! closed set of tagged variants; the executor matches them exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ChronError, Result};

/// A leaf or combinator clause of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    /// Exact match on a keyword-indexed field value.
    Term { field: String, value: Value },
    /// Ordered comparison on a field value; open bounds are `None`.
    Range {
        field: String,
        min: Option<Value>,
        max: Option<Value>,
    },
    /// Full-text search over a field (or all text fields when `None`).
    Fts { field: Option<String>, query: String },
    MatchAll,
    And(Vec<Clause>),
    Or(Vec<Clause>),
    Not(Box<Clause>),
}

impl Clause {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Clause {
        Clause::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn fts(field: Option<&str>, query: impl Into<String>) -> Clause {
        Clause::Fts {
            field: field.map(|f| f.to_string()),
            query: query.into(),
        }
    }

    pub fn and(clauses: Vec<Clause>) -> Clause {
        Clause::And(clauses)
    }

    pub fn or(clauses: Vec<Clause>) -> Clause {
        Clause::Or(clauses)
    }

    pub fn not(clause: Clause) -> Clause {
        Clause::Not(Box::new(clause))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Ordered sort descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

/// A full query: one clause tree plus execution options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub clause: Clause,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    /// Branch to query; the configured default when absent.
    #[serde(default)]
    pub branch: Option<String>,
    /// Opaque continuation token from a previous page; wins over `offset`.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Force a synchronous catch-up before executing when the branch index
    /// is stale.
    #[serde(default)]
    pub refresh: bool,
}

impl Query {
    pub fn new(clause: Clause) -> Query {
        Query {
            clause,
            sort: Vec::new(),
            limit: None,
            offset: 0,
            branch: None,
            cursor: None,
            refresh: false,
        }
    }

    pub fn sorted_by(mut self, field: impl Into<String>, order: SortOrder) -> Query {
        self.sort.push(SortSpec {
            field: field.into(),
            order,
        });
        self
    }

    pub fn limited(mut self, limit: usize) -> Query {
        self.limit = Some(limit);
        self
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Query {
        self.branch = Some(branch.into());
        self
    }
}

const CURSOR_PREFIX: &str = "offset:";

/// Encode a pagination offset as an opaque continuation token.
pub fn encode_cursor(offset: usize) -> String {
    hex::encode(format!("{CURSOR_PREFIX}{offset}"))
}

/// Decode a continuation token back to its offset.
pub fn decode_cursor(cursor: &str) -> Result<usize> {
    let bytes = hex::decode(cursor)
        .map_err(|_| ChronError::InvalidArgument(format!("malformed cursor `{cursor}`")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| ChronError::InvalidArgument(format!("malformed cursor `{cursor}`")))?;
    text.strip_prefix(CURSOR_PREFIX)
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| ChronError::InvalidArgument(format!("malformed cursor `{cursor}`")))
}
