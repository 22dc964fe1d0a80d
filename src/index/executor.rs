//! Query execution against the branch index. Given the same corpus and
//! query the executor is deterministic: results are always fully sorted
//! (explicit descriptors first, id as the stable tie-break) before paging.

use std::cmp::Ordering;

use ahash::AHashSet;
use serde_json::Value;

use crate::engine::DocumentEngine;
use crate::errors::Result;
use crate::index::query::{Clause, Query, SortOrder, decode_cursor, encode_cursor};
use crate::index::tokenizer::tokenize_unique;
use crate::index::{BranchIndex, FTS_SUFFIX, SearchIndex};

/// Short fts tokens match as substrings, longer ones as prefixes. The
/// threshold is part of the query contract; changing it is a compatibility
/// break.
const FTS_SUBSTRING_MAX_LEN: usize = 3;

/// A page of matching document ids plus a continuation cursor when more
/// results exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults {
    pub ids: Vec<String>,
    pub cursor: Option<String>,
    /// Total matches before paging.
    pub total: usize,
}

/// Execute a query. With `refresh` set and the branch flagged stale, the
/// index is synchronously caught up from storage first; otherwise the
/// documented bounded staleness applies.
pub fn execute(index: &SearchIndex, engine: &DocumentEngine, query: &Query) -> Result<SearchResults> {
    let branch = query
        .branch
        .as_deref()
        .unwrap_or(&engine.config().default_branch);
    if query.refresh && index.is_stale(branch) {
        index.catch_up(engine, branch)?;
    }
    let entry = index.branch(branch);

    let matched = eval(&entry, &query.clause);
    let mut ids: Vec<String> = matched.into_iter().collect();
    sort_ids(&entry, &mut ids, query);

    let total = ids.len();
    let offset = match &query.cursor {
        Some(cursor) => decode_cursor(cursor)?,
        None => query.offset,
    };
    let offset = offset.min(total);
    let end = match query.limit {
        Some(limit) => (offset + limit).min(total),
        None => total,
    };
    let page = ids[offset..end].to_vec();
    let cursor = if end < total {
        Some(encode_cursor(end))
    } else {
        None
    };
    Ok(SearchResults {
        ids: page,
        cursor,
        total,
    })
}

fn all_ids(entry: &BranchIndex) -> AHashSet<String> {
    entry.docs.iter().map(|e| e.key().clone()).collect()
}

fn eval(entry: &BranchIndex, clause: &Clause) -> AHashSet<String> {
    match clause {
        Clause::MatchAll => all_ids(entry),
        Clause::Term { field, value } => entry
            .docs
            .iter()
            .filter(|e| {
                e.value()
                    .values
                    .get(field)
                    .is_some_and(|stored| term_matches(stored, value))
            })
            .map(|e| e.key().clone())
            .collect(),
        Clause::Range { field, min, max } => entry
            .docs
            .iter()
            .filter(|e| {
                e.value().values.get(field).is_some_and(|stored| {
                    let above = min.as_ref().is_none_or(|m| {
                        compare_values(stored, m).is_some_and(|o| o != Ordering::Less)
                    });
                    let below = max.as_ref().is_none_or(|m| {
                        compare_values(stored, m).is_some_and(|o| o != Ordering::Greater)
                    });
                    above && below
                })
            })
            .map(|e| e.key().clone())
            .collect(),
        Clause::Fts { field, query } => eval_fts(entry, field.as_deref(), query),
        Clause::And(clauses) => {
            let mut sets = clauses.iter().map(|c| eval(entry, c));
            let Some(mut acc) = sets.next() else {
                return all_ids(entry);
            };
            for set in sets {
                acc.retain(|id| set.contains(id));
            }
            acc
        }
        Clause::Or(clauses) => {
            let mut acc = AHashSet::new();
            for clause in clauses {
                acc.extend(eval(entry, clause));
            }
            acc
        }
        Clause::Not(inner) => {
            let excluded = eval(entry, inner);
            entry
                .docs
                .iter()
                .map(|e| e.key().clone())
                .filter(|id| !excluded.contains(id))
                .collect()
        }
    }
}

/// Exact keyword match; a stored array also matches on membership.
fn term_matches(stored: &Value, wanted: &Value) -> bool {
    if stored == wanted {
        return true;
    }
    match stored {
        Value::Array(items) => items.iter().any(|item| item == wanted),
        _ => false,
    }
}

/// Query tokens combine with AND semantics; each token matches per the
/// wildcard rule: tokens shorter than 4 characters match as `*token*`,
/// longer ones as `token*`.
fn eval_fts(entry: &BranchIndex, field: Option<&str>, query: &str) -> AHashSet<String> {
    let query_tokens = tokenize_unique(query);
    if query_tokens.is_empty() {
        return AHashSet::new();
    }
    entry
        .docs
        .iter()
        .filter(|e| {
            let doc = e.value();
            query_tokens.iter().all(|token| {
                let matches_in = |tokens: &Vec<String>| {
                    tokens.iter().any(|stored| {
                        if token.len() <= FTS_SUBSTRING_MAX_LEN {
                            stored.contains(token.as_str())
                        } else {
                            stored.starts_with(token.as_str())
                        }
                    })
                };
                match field {
                    Some(name) if name.ends_with(FTS_SUFFIX) => {
                        doc.fts.get(name).is_some_and(matches_in)
                    }
                    Some(name) => doc.text.get(name).is_some_and(matches_in),
                    None => {
                        doc.fts.values().any(|t| matches_in(t))
                            || doc.text.values().any(|t| matches_in(t))
                    }
                }
            })
        })
        .map(|e| e.key().clone())
        .collect()
}

/// Ordered comparison of two keyword values. Numbers compare numerically,
/// strings lexicographically, booleans false-before-true; mixed kinds do
/// not compare.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn sort_ids(entry: &BranchIndex, ids: &mut [String], query: &Query) {
    ids.sort_by(|a, b| {
        for spec in &query.sort {
            let left = entry.docs.get(a).and_then(|d| d.values.get(&spec.field).cloned());
            let right = entry.docs.get(b).and_then(|d| d.values.get(&spec.field).cloned());
            let ordering = match (&left, &right) {
                (Some(l), Some(r)) => compare_values(l, r).unwrap_or(Ordering::Equal),
                // Documents missing the sort field go last.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = match spec.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.cmp(b)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbConfig;
    use crate::document::Document;
    use crate::hash::{HashKind, set_hash_kind_scoped};
    use crate::index::query::SortSpec;
    use crate::internal::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn fixture() -> (SearchIndex, DocumentEngine) {
        let config = DbConfig::default();
        let engine = DocumentEngine::new(Arc::new(MemoryStore::new()), config.clone());
        let index = SearchIndex::new(&config).unwrap();
        for v in [
            json!({"id": "user:1", "name": "Alice", "age": 30, "bio_fts": "storage engines"}),
            json!({"id": "user:2", "name": "Bob", "age": 25, "bio_fts": "compilers"}),
            json!({"id": "user:3", "name": "Alice", "age": 41, "tags": ["admin", "ops"]}),
            json!({"id": "order:1", "total": 99}),
        ] {
            index
                .index_document("main", &Document::from_value(v).unwrap())
                .unwrap();
        }
        (index, engine)
    }

    fn run(index: &SearchIndex, engine: &DocumentEngine, query: Query) -> Vec<String> {
        execute(index, engine, &query).unwrap().ids
    }

    #[test]
    fn test_term_and_sort_determinism() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let (index, engine) = fixture();
        let query = Query::new(Clause::term("name", "Alice"));
        // Default sort is by id, so repeated runs agree.
        assert_eq!(run(&index, &engine, query.clone()), vec!["user:1", "user:3"]);
        assert_eq!(run(&index, &engine, query), vec!["user:1", "user:3"]);
    }

    #[test]
    fn test_term_matches_array_membership() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let (index, engine) = fixture();
        let ids = run(&index, &engine, Query::new(Clause::term("tags", "admin")));
        assert_eq!(ids, vec!["user:3"]);
    }

    #[test]
    fn test_range_query() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let (index, engine) = fixture();
        let clause = Clause::Range {
            field: "age".to_string(),
            min: Some(json!(26)),
            max: Some(json!(41)),
        };
        assert_eq!(run(&index, &engine, Query::new(clause)), vec!["user:1", "user:3"]);
    }

    #[test]
    fn test_combinators() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let (index, engine) = fixture();
        let clause = Clause::and(vec![
            Clause::term("name", "Alice"),
            Clause::not(Clause::term("age", json!(41))),
        ]);
        assert_eq!(run(&index, &engine, Query::new(clause)), vec!["user:1"]);

        let either = Clause::or(vec![
            Clause::term("name", "Bob"),
            Clause::term("total", json!(99)),
        ]);
        assert_eq!(
            run(&index, &engine, Query::new(either)),
            vec!["order:1", "user:2"]
        );
    }

    #[test]
    fn test_fts_wildcard_threshold() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let (index, engine) = fixture();
        // 4+ characters: prefix match.
        let ids = run(&index, &engine, Query::new(Clause::fts(Some("bio_fts"), "stor")));
        assert_eq!(ids, vec!["user:1"]);
        // A non-prefix infix does not match at 4+ characters.
        let ids = run(&index, &engine, Query::new(Clause::fts(Some("bio_fts"), "ngine")));
        assert!(ids.is_empty());
        // Up to 3 characters: substring match.
        let ids = run(&index, &engine, Query::new(Clause::fts(Some("bio_fts"), "gin")));
        assert_eq!(ids, vec!["user:1"]);
    }

    #[test]
    fn test_fts_across_all_text_fields() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let (index, engine) = fixture();
        let ids = run(&index, &engine, Query::new(Clause::fts(None, "alice")));
        assert_eq!(ids, vec!["user:1", "user:3"]);
    }

    #[test]
    fn test_sort_limit_offset_and_cursor() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let (index, engine) = fixture();
        let query = Query {
            sort: vec![SortSpec {
                field: "age".to_string(),
                order: SortOrder::Desc,
            }],
            limit: Some(2),
            ..Query::new(Clause::MatchAll)
        };
        let page1 = execute(&index, &engine, &query).unwrap();
        // Ages 41, 30 first; documents without the field sort last.
        assert_eq!(page1.ids, vec!["user:3", "user:1"]);
        assert_eq!(page1.total, 4);
        let cursor = page1.cursor.clone().unwrap();

        let page2 = execute(
            &index,
            &engine,
            &Query {
                cursor: Some(cursor),
                ..query.clone()
            },
        )
        .unwrap();
        assert_eq!(page2.ids, vec!["user:2", "order:1"]);
        assert!(page2.cursor.is_none());
    }

    #[test]
    fn test_empty_and_is_match_all() {
        let _guard = set_hash_kind_scoped(HashKind::Sha1);
        let (index, engine) = fixture();
        assert_eq!(run(&index, &engine, Query::new(Clause::And(vec![]))).len(), 4);
    }
}
