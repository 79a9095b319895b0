//! HTTP-level behavior of the write engine against a mocked backend.

use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use search_engine::{MasterProbe, WriteEngine, WriteOutcome, WriterRole};
use search_types::{DocumentEnvelope, EngineSettings};

fn envelope(id: &str, date: &str) -> DocumentEnvelope {
    DocumentEnvelope::from_body(
        "tender",
        json!({"id": id, "dateModified": date, "status": "complete"}),
    )
    .unwrap()
}

fn settings(server: &MockServer, bulk_insert: bool) -> EngineSettings {
    EngineSettings {
        store_url: server.uri(),
        timeout_secs: 5,
        bulk_insert,
        error_wait_secs: 0,
        start_wait_secs: 0,
        ..Default::default()
    }
}

async fn engine(server: &MockServer, bulk_insert: bool) -> (tempfile::TempDir, WriteEngine) {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("index_names");
    let engine = WriteEngine::new(
        settings(server, bulk_insert),
        prefix.to_str().unwrap(),
        CancellationToken::new(),
    )
    .unwrap();
    (dir, engine)
}

#[tokio::test]
async fn single_write_is_versioned_and_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/tenders_1/tender/t-1"))
        .and(query_param("version_type", "external"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"_version": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, mut engine) = engine(&server, false).await;
    let outcome = engine
        .index_item("tenders_1", envelope("t-1", "2024-03-01T10:00:00+00:00"))
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Written);
}

#[tokio::test]
async fn version_conflict_is_a_skip_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"error": "conflict"})))
        .mount(&server)
        .await;

    let (_dir, mut engine) = engine(&server, false).await;
    let outcome = engine
        .index_item("tenders_1", envelope("t-1", "2024-03-01T10:00:00+00:00"))
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Skipped);
}

#[tokio::test]
async fn transient_failure_is_retried_then_written() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"_version": 1})))
        .expect(1)
        .mount(&server)
        .await;
    // Existence probe between attempts: not stored yet
    Mock::given(method("GET"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (_dir, mut engine) = engine(&server, false).await;
    let outcome = engine
        .index_item("tenders_1", envelope("t-1", "2024-03-01T10:00:00+00:00"))
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Written);
}

#[tokio::test]
async fn exhausted_retries_are_swallowed_when_ignore_errors_is_set() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&server, false);
    settings.ignore_errors = true;
    let mut engine = WriteEngine::new(
        settings,
        dir.path().join("index_names").to_str().unwrap(),
        CancellationToken::new(),
    )
    .unwrap();
    let outcome = engine
        .index_item("tenders_1", envelope("t-1", "2024-03-01T10:00:00+00:00"))
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Dropped);
}

#[tokio::test]
async fn corrupt_envelope_is_dropped_without_any_backend_call() {
    let server = MockServer::start().await;
    let (_dir, mut engine) = engine(&server, false).await;

    let mut item = envelope("t-1", "2024-03-01T10:00:00+00:00");
    item.meta.version += 1; // no longer encodes dateModified
    let outcome = engine.index_item("tenders_1", item).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Dropped);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn small_bulk_buffer_falls_back_to_per_item_writes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"_version": 1})))
        .expect(3)
        .mount(&server)
        .await;

    let (_dir, mut engine) = engine(&server, true).await;
    for i in 0..3 {
        let outcome = engine
            .index_item(
                "tenders_1",
                envelope(&format!("t-{i}"), "2024-03-01T10:00:00+00:00"),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Buffered);
    }
    engine.flush_bulk().await.unwrap();
    assert_eq!(engine.buffered(), 0);
    // No bulk endpoint was touched
    let bulk_calls = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/_bulk")
        .count();
    assert_eq!(bulk_calls, 0);
}

#[tokio::test]
async fn large_bulk_buffer_is_deduplicated_and_sent_in_one_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": []})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, mut engine) = engine(&server, true).await;
    for i in 0..60 {
        engine
            .index_item(
                "tenders_1",
                envelope(&format!("t-{i}"), "2024-03-01T10:00:00+00:00"),
            )
            .await
            .unwrap();
    }
    // Same id again at a newer and then an older version: one survivor
    engine
        .index_item("tenders_1", envelope("t-0", "2024-03-02T10:00:00+00:00"))
        .await
        .unwrap();
    engine
        .index_item("tenders_1", envelope("t-0", "2024-02-01T10:00:00+00:00"))
        .await
        .unwrap();
    engine.flush_bulk().await.unwrap();
    assert!(!engine.bulk_degraded());

    let requests = server.received_requests().await.unwrap();
    let bulk_body = requests
        .iter()
        .find(|r| r.url.path() == "/_bulk")
        .map(|r| String::from_utf8(r.body.clone()).unwrap())
        .unwrap();
    let action_lines: Vec<Value> = bulk_body
        .lines()
        .step_by(2)
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(action_lines.len(), 60);
    let t0_versions: Vec<u64> = action_lines
        .iter()
        .filter(|a| a.pointer("/index/_id").and_then(Value::as_str) == Some("t-0"))
        .map(|a| a.pointer("/index/_version").and_then(Value::as_u64).unwrap())
        .collect();
    assert_eq!(t0_versions.len(), 1);
    // The March 2nd version won over both earlier ones
    let newest = envelope("t-0", "2024-03-02T10:00:00+00:00").meta.version;
    assert_eq!(t0_versions[0], newest);
}

#[tokio::test]
async fn bulk_failure_degrades_and_requeues_for_per_item_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex("^/tenders_1/tender/.*"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"_version": 1})))
        .expect(50)
        .mount(&server)
        .await;

    let (_dir, mut engine) = engine(&server, true).await;
    for i in 0..50 {
        engine
            .index_item(
                "tenders_1",
                envelope(&format!("t-{i}"), "2024-03-01T10:00:00+00:00"),
            )
            .await
            .unwrap();
    }
    engine.flush_bulk().await.unwrap();
    assert!(engine.bulk_degraded());
    assert_eq!(engine.buffered(), 50);

    // Degraded flush drains everything through the per-item path
    engine.flush_bulk().await.unwrap();
    assert_eq!(engine.buffered(), 0);
    assert!(!engine.bulk_degraded());
}

#[tokio::test]
async fn stale_master_heartbeat_promotes_standby_to_writer() {
    let backend = MockServer::start().await;
    let master = MockServer::start().await;
    let stale = chrono::Utc::now().timestamp() - 700;
    Mock::given(method("GET"))
        .and(path("/heartbeat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"heartbeat": stale, "index_names": {}})),
        )
        .mount(&master)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&backend, false);
    settings.slave_mode = Some(format!("{}/heartbeat", master.uri()));
    settings.slave_wakeup_secs = 600;
    let mut engine = WriteEngine::new(
        settings,
        dir.path().join("index_names").to_str().unwrap(),
        CancellationToken::new(),
    )
    .unwrap();
    engine.set_probe(Some(
        MasterProbe::with_cache_ttl(
            &format!("{}/heartbeat", master.uri()),
            Duration::from_secs(0),
        )
        .unwrap(),
    ));

    assert_eq!(engine.writer_role().await, WriterRole::Proceed);
}

#[tokio::test]
async fn live_master_keeps_standby_down_and_syncs_names() {
    let backend = MockServer::start().await;
    let master = MockServer::start().await;
    let fresh = chrono::Utc::now().timestamp() - 5;
    Mock::given(method("GET"))
        .and(path("/heartbeat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "heartbeat": fresh,
            "index_names": {"tenders": "tenders_1700000000"},
        })))
        .mount(&master)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&backend, false);
    settings.slave_mode = Some(format!("{}/heartbeat", master.uri()));
    let mut engine = WriteEngine::new(
        settings,
        dir.path().join("index_names").to_str().unwrap(),
        CancellationToken::new(),
    )
    .unwrap();
    engine.set_probe(Some(
        MasterProbe::with_cache_ttl(
            &format!("{}/heartbeat", master.uri()),
            Duration::from_secs(0),
        )
        .unwrap(),
    ));

    assert_eq!(engine.writer_role().await, WriterRole::StandDown);
    assert_eq!(
        engine.get_name("tenders").as_deref(),
        Some("tenders_1700000000")
    );
}

#[tokio::test]
async fn wait_for_backend_rejects_unsupported_version() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"version": {"number": "0.90.3"}})),
        )
        .mount(&server)
        .await;

    let (_dir, mut engine) = engine(&server, false).await;
    assert!(matches!(
        engine.wait_for_backend().await,
        Err(search_engine::EngineError::UnsupportedBackend(_))
    ));
}

#[tokio::test]
async fn search_translates_hits_and_surfaces_errors_as_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tenders_1700000000/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": {
                "total": 2,
                "hits": [
                    {"_source": {"id": "a"}},
                    {"_source": {"id": "b"}},
                ],
            }
        })))
        .mount(&server)
        .await;

    let (_dir, mut engine) = engine(&server, false).await;
    engine.set_name("tenders", "tenders_1700000000").unwrap();

    let result = engine
        .search(&["tenders"], &json!({"query": {"match_all": {}}}), 0, 10)
        .await;
    assert!(result.error.is_none());
    assert_eq!(result.total, 2);
    assert_eq!(result.items.len(), 2);

    // Unknown logical key: explicit error payload, no panic
    let result = engine.search(&["plans"], &json!({}), 0, 10).await;
    assert_eq!(result.error.as_deref(), Some("current index not found"));
}

#[tokio::test]
async fn alias_swap_tolerates_missing_stale_alias() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/tenders_*/_alias/tenders"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/tenders_1700000000/_alias/tenders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, engine) = engine(&server, false).await;
    engine.set_alias("tenders", "tenders_1700000000").await;
}
