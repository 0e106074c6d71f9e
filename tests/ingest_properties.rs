//! End-to-end properties of the ingest path
//!
//! Dedup under concurrent resubmission, idempotence, audit/event count
//! equality, search visibility and tombstone behavior, all through the
//! public pipeline and query APIs.

mod common;

use common::{generic_delete, generic_edit, generic_message, memory_store, pipeline, TestStore};
use std::sync::Arc;
use telecache::config::QueryConfig;
use telecache::{
    AuditOperation, CancellationToken, Collection, IngestOutcome, MessageStore, QueryService,
    SearchRequest,
};
use tokio::task::JoinSet;

const T0: &str = "2024-03-01T10:00:00Z";
const T1: &str = "2024-03-01T10:05:00Z";
const T2: &str = "2024-03-01T10:10:00Z";

fn queries(store: Arc<dyn MessageStore>) -> QueryService {
    QueryService::new(store, QueryConfig::default())
}

async fn search_ids(queries: &QueryService, request: SearchRequest) -> Vec<String> {
    queries
        .search_messages(request, &CancellationToken::new())
        .await
        .unwrap()
        .hits
        .into_iter()
        .map(|hit| hit.message.id.to_string())
        .collect()
}

#[tokio::test]
async fn test_hello_world_scenario() {
    let store = memory_store();
    let pipeline = pipeline(store.clone());
    let queries = queries(store.clone());
    let e1 = generic_message("e1", 42, "hello world", T0);

    let first = pipeline.ingest("test", &e1).await.unwrap();
    assert!(matches!(first, IngestOutcome::Stored(_)));
    let found = search_ids(&queries, SearchRequest::new("hello")).await;
    assert!(found.contains(&"e1".to_string()));

    let again = pipeline.ingest("test", &e1).await.unwrap();
    assert!(matches!(again, IngestOutcome::Duplicate { .. }));

    let stats = store.stats().unwrap();
    assert_eq!(stats.total_messages, 1);
    let audit = store.audit_for("e1").unwrap();
    let creations: Vec<_> = audit
        .iter()
        .filter(|entry| entry.operation == AuditOperation::MessageCreated)
        .collect();
    assert_eq!(creations.len(), 1);
    assert_eq!(audit.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resubmission_stores_once() {
    let test_store = TestStore::open(4);
    let pipeline = Arc::new(pipeline(test_store.shared()));
    let raw = generic_message("race-1", 5, "first past the post", T0);

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let pipeline = pipeline.clone();
        let raw = raw.clone();
        tasks.spawn(async move { pipeline.ingest("race", &raw).await });
    }

    let mut stored = 0;
    let mut duplicates = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap().unwrap() {
            IngestOutcome::Stored(_) => stored += 1,
            IngestOutcome::Duplicate { .. } => duplicates += 1,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    assert_eq!(stored, 1);
    assert_eq!(duplicates, 15);

    let stats = test_store.store.stats().unwrap();
    assert_eq!(stats.total_messages, 1);
    assert_eq!(stats.events, 1);
    assert_eq!(stats.audit_entries, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_message_under_racing_event_ids() {
    let test_store = TestStore::open(4);
    let pipeline = Arc::new(pipeline(test_store.shared()));

    let mut tasks = JoinSet::new();
    for n in 0..8 {
        let pipeline = pipeline.clone();
        // Distinct event ids, one message id
        let raw = serde_json::json!({
            "id": format!("delivery-{}", n),
            "message_id": "msg-1",
            "chat_id": 5,
            "text": "duplicated delivery",
            "timestamp": T0,
        })
        .to_string();
        tasks.spawn(async move { pipeline.ingest("race", &raw).await });
    }

    let mut stored = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap().unwrap() {
            IngestOutcome::Stored(_) => stored += 1,
            IngestOutcome::Duplicate { collection, existing_id } => {
                assert_eq!(collection, Collection::Messages);
                assert_eq!(existing_id, "msg-1");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    assert_eq!(stored, 1);

    let stats = test_store.store.stats().unwrap();
    assert_eq!(stats.total_messages, 1);
    // Rejected deliveries leave no event behind
    assert_eq!(stats.events, 1);
    assert_eq!(stats.audit_entries, stats.events);
}

#[tokio::test]
async fn test_search_finds_text_inside_words() {
    let store = memory_store();
    let pipeline = pipeline(store.clone());
    let queries = queries(store.clone());
    pipeline
        .ingest("test", &generic_message("e1", 42, "hello world", T0))
        .await
        .unwrap();
    pipeline
        .ingest("test", &generic_message("e2", 42, "helloworld", T1))
        .await
        .unwrap();

    let mut ello = search_ids(&queries, SearchRequest::new("ello")).await;
    ello.sort();
    assert_eq!(ello, vec!["e1", "e2"]);
    let mut world = search_ids(&queries, SearchRequest::new("world")).await;
    world.sort();
    assert_eq!(world, vec!["e1", "e2"]);
    assert_eq!(search_ids(&queries, SearchRequest::new("lo wo")).await, vec!["e1"]);
}

#[tokio::test]
async fn test_resubmitting_history_changes_nothing() {
    let store = memory_store();
    let pipeline = pipeline(store.clone());
    let history = [
        generic_message("m1", 1, "draft one", T0),
        generic_message("m2", 1, "another note", T0),
        generic_edit("m1-edit", "m1", "final one", T1),
        generic_delete("m2-del", "m2", T2),
    ];
    for raw in &history {
        pipeline.ingest("test", raw).await.unwrap();
    }
    let stats = store.stats().unwrap();
    let export = store.export().unwrap();
    let audit_m1 = store.audit_for("m1").unwrap();

    for raw in &history {
        let outcome = pipeline.ingest("test", raw).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Duplicate { .. }));
    }
    assert_eq!(store.stats().unwrap(), stats);
    assert_eq!(store.export().unwrap(), export);
    assert_eq!(store.audit_for("m1").unwrap(), audit_m1);
}

#[tokio::test]
async fn test_audit_entries_match_accepted_events() {
    let store = memory_store();
    let pipeline = pipeline(store.clone());
    let events = [
        generic_message("a", 1, "alpha", T0),
        generic_message("b", 1, "beta", T0),
        generic_message("a", 1, "alpha again", T1),
        generic_edit("a-1", "a", "alpha edited", T1),
        generic_delete("b-1", "b", T2),
        generic_edit("b-2", "b", "edit after delete", T2),
        "{broken".to_string(),
        serde_json::json!({"id": "r1", "type": "reaction", "message_id": "a", "emoji": "🔥", "timestamp": T2})
            .to_string(),
    ];
    for raw in &events {
        let _ = pipeline.ingest("test", raw).await;
    }

    let stats = store.stats().unwrap();
    // a, b, a-1, b-1, r1 accepted; the repeat, the conflict and the broken line were not
    assert_eq!(stats.events, 5);
    assert_eq!(stats.audit_entries, stats.events);
}

#[tokio::test]
async fn test_search_covers_text_and_caption_deterministically() {
    let store = memory_store();
    let pipeline = pipeline(store.clone());
    let queries = queries(store.clone());

    pipeline
        .ingest("test", &generic_message("t1", 1, "meeting notes for Tuesday", T0))
        .await
        .unwrap();
    let captioned = serde_json::json!({
        "id": "c1",
        "chat_id": 1,
        "caption": "whiteboard from the meeting",
        "attachments": [{"kind": "photo", "file_id": "AgAD"}],
        "timestamp": T1,
    })
    .to_string();
    pipeline.ingest("test", &captioned).await.unwrap();
    pipeline
        .ingest("test", &generic_message("x1", 1, "unrelated chatter", T2))
        .await
        .unwrap();

    let by_text = search_ids(&queries, SearchRequest::new("Tuesday")).await;
    assert_eq!(by_text, vec!["t1"]);
    let by_caption = search_ids(&queries, SearchRequest::new("whiteboard")).await;
    assert_eq!(by_caption, vec!["c1"]);

    let both = search_ids(&queries, SearchRequest::new("meeting")).await;
    assert_eq!(both.len(), 2);
    for _ in 0..3 {
        assert_eq!(search_ids(&queries, SearchRequest::new("meeting")).await, both);
    }
}

#[tokio::test]
async fn test_deleted_message_is_hidden_but_kept() {
    let store = memory_store();
    let pipeline = pipeline(store.clone());
    let queries = queries(store.clone());

    pipeline
        .ingest("test", &generic_message("m1", 9, "regrettable message", T0))
        .await
        .unwrap();
    pipeline.ingest("test", &generic_delete("m1-del", "m1", T1)).await.unwrap();

    let message = queries.get_message("m1").await.unwrap().expect("still retrievable");
    assert!(message.is_tombstoned());
    assert_eq!(message.text.as_deref(), Some("regrettable message"));

    assert!(search_ids(&queries, SearchRequest::new("regrettable")).await.is_empty());
    let mut with_deleted = SearchRequest::new("regrettable");
    with_deleted.include_deleted = true;
    assert_eq!(search_ids(&queries, with_deleted).await, vec!["m1"]);

    let trail = queries.audit_trail("m1").await.unwrap();
    assert_eq!(
        trail.iter().map(|entry| entry.operation).collect::<Vec<_>>(),
        vec![AuditOperation::MessageCreated, AuditOperation::MessageTombstoned]
    );
    assert!(trail[1].before.as_ref().unwrap()["deleted_at"].is_null());
    assert!(!trail[1].after.as_ref().unwrap()["deleted_at"].is_null());
}

#[tokio::test]
async fn test_store_survives_reopen() {
    let test_store = TestStore::open(2);
    let path = test_store.dir.path().join("telegram_cache.db");
    {
        let pipeline = pipeline(test_store.shared());
        pipeline
            .ingest("test", &generic_message("keep", 3, "persisted text", T0))
            .await
            .unwrap();
    }

    let config = telecache::config::StoreConfig {
        db_path: Some(path),
        ..Default::default()
    };
    let reopened = <telecache::SqliteStore as telecache::OpenStore>::open(
        config.resolved_path(),
        &config,
        &telecache::Credentials::read_only("auditor"),
    )
    .unwrap();
    assert!(reopened.get(&"keep".into()).unwrap().is_some());
    assert_eq!(reopened.audit_for("keep").unwrap().len(), 1);
}
