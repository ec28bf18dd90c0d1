//! Test history persisted in a DuckDB file survives reopening.

use std::sync::Arc;

use serde_json::json;

use status_console::store::TestResultStore;
use status_console::workflow::{MashupTests, Phase};

async fn open(path: &std::path::Path) -> MashupTests {
    let tests = MashupTests::new(Arc::new(TestResultStore::open(path)));
    tests.start().await;
    tests
}

#[tokio::test]
async fn reopened_history_matches_optimistic_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("tests.duckdb");

    let expected = {
        let tests = open(&path).await;
        assert!(tests.is_durable());
        tests.add_test("m1", "a", json!({"ok": true})).await.unwrap();
        tests.add_test("m1", "b", json!({"ok": false})).await.unwrap();
        tests.add_test("m2", "c", json!({"errors": ["boom"]})).await.unwrap();
        tests.add_test("m3", "d", json!(null)).await.unwrap();
        tests.delete_test("m3", "d").await.unwrap();
        (
            tests.mashup_ids(),
            tests.get_tests_for_mashup_sync("m1"),
            tests.get_tests_for_mashup_sync("m2"),
        )
    };

    let reopened = open(&path).await;

    assert_eq!(reopened.phase(), Phase::Ready);
    assert_eq!(reopened.mashup_ids(), expected.0);
    assert_eq!(reopened.get_tests_for_mashup_sync("m1"), expected.1);
    assert_eq!(reopened.get_tests_for_mashup_sync("m2"), expected.2);
}

#[tokio::test]
async fn upsert_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tests.duckdb");

    {
        let store = TestResultStore::open(&path);
        store.initialize().await.unwrap();
        store.put_test("m1", "t1", json!({"ok": true})).await.unwrap();
        store.put_test("m1", "t1", json!({"ok": false})).await.unwrap();
    }

    let store = TestResultStore::open(&path);
    store.initialize().await.unwrap();
    let tests = store.get_tests_for_mashup("m1").await.unwrap();
    assert_eq!(tests.len(), 1);
    assert_eq!(tests[0].results, json!({"ok": false}));
}

#[tokio::test]
async fn clear_for_mashup_is_durable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tests.duckdb");

    {
        let tests = open(&path).await;
        tests.add_test("m1", "a", json!(1)).await.unwrap();
        tests.add_test("m2", "b", json!(2)).await.unwrap();
        tests.clear_tests_for_mashup("m1").await.unwrap();
    }

    let reopened = open(&path).await;
    assert_eq!(reopened.mashup_ids(), vec!["m2"]);
    assert_eq!(reopened.store().count().await.unwrap(), 1);
}
