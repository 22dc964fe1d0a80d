//! Index convergence: every document at head is findable, deleted
//! documents are not, and a stale branch catches up from storage.

use chrondb::index::{Clause, Query, SortOrder};
use chrondb::{Database, DbConfig, Document};
use serde_json::json;

fn doc(v: serde_json::Value) -> Document {
    Document::from_value(v).unwrap()
}

fn db() -> Database {
    Database::in_memory(DbConfig::default()).unwrap()
}

#[test]
fn term_query_tracks_head() {
    let db = db();
    db.save(doc(json!({"id": "user:1", "name": "Alice"}))).unwrap();
    db.save(doc(json!({"id": "user:2", "name": "Bob"}))).unwrap();

    let hits = db.search(&Query::new(Clause::term("name", "Alice"))).unwrap();
    assert_eq!(hits.ids, vec!["user:1"]);

    db.delete("user:1").unwrap();
    let hits = db.search(&Query::new(Clause::term("name", "Alice"))).unwrap();
    assert!(hits.ids.is_empty());
}

#[test]
fn refresh_rebuilds_a_stale_branch() {
    let db = db();
    db.save(doc(json!({"id": "user:1", "name": "Alice"}))).unwrap();
    db.save(doc(json!({"id": "user:2", "name": "Alba"}))).unwrap();

    // Simulate an index that fell behind: wipe its view and flag staleness.
    db.index().remove("main", "user:1");
    db.index().remove("main", "user:2");
    db.index().mark_stale("main");

    // Without refresh the lag is visible.
    let lagging = db
        .search(&Query::new(Clause::fts(None, "al")))
        .unwrap();
    assert!(lagging.ids.is_empty());

    // With refresh the executor catches up from storage first.
    let query = Query {
        refresh: true,
        ..Query::new(Clause::fts(None, "al"))
    };
    let fresh = db.search(&query).unwrap();
    assert_eq!(fresh.ids, vec!["user:1", "user:2"]);
    assert!(!db.index().is_stale("main"));
}

#[test]
fn queries_are_branch_scoped() {
    let db = db();
    db.save_on("main", doc(json!({"id": "cfg:1", "mode": "prod"}))).unwrap();
    db.save_on("dev", doc(json!({"id": "cfg:1", "mode": "dev"}))).unwrap();

    let on_main = db
        .search(&Query::new(Clause::term("mode", "prod")))
        .unwrap();
    assert_eq!(on_main.ids, vec!["cfg:1"]);

    let on_dev = db
        .search(&Query::new(Clause::term("mode", "prod")).on_branch("dev"))
        .unwrap();
    assert!(on_dev.ids.is_empty());
}

#[test]
fn paging_is_stable_under_sort() {
    let db = db();
    for i in 0..10 {
        db.save(doc(json!({"id": format!("n:{i:02}"), "rank": i}))).unwrap();
    }
    let query = Query::new(Clause::MatchAll)
        .sorted_by("rank", SortOrder::Desc)
        .limited(4);

    let mut collected = Vec::new();
    let mut cursor = None;
    loop {
        let page = db
            .search(&Query {
                cursor: cursor.clone(),
                ..query.clone()
            })
            .unwrap();
        collected.extend(page.ids);
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    let expected: Vec<String> = (0..10).rev().map(|i| format!("n:{i:02}")).collect();
    assert_eq!(collected, expected);
}
