//! End-to-end tests for the sync pipeline: feeds in, Prom batches out.
//!
//! Feeds and the Prom API are both served by wiremock. Each test resolves its
//! own settings from an in-memory environment, so nothing leaks between tests.

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use prom_feed_sync::config::{ConfigError, FileConfig, Settings};
use prom_feed_sync::exit::{exit_code_for, EXIT_CONFIG, EXIT_FAILURES};
use prom_feed_sync::state::SyncState;
use prom_feed_sync::sync::{self, SyncError, SyncOptions};
use prom_feed_sync::util::RetryPolicy;

const EDIT_PATH: &str = "/api/v1/products/edit_by_external_id";

const FEED_A: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<yml_catalog date="2024-05-01 12:00">
  <shop>
    <offers>
      <offer id="1" available="true">
        <vendorCode>A-1</vendorCode>
        <price>100.50</price>
        <quantity>3</quantity>
      </offer>
      <offer id="2" available="false">
        <price>20</price>
      </offer>
    </offers>
  </shop>
</yml_catalog>"#;

const FEED_B: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<yml_catalog>
  <shop>
    <offers>
      <offer id="9">
        <vendorCode>A-1</vendorCode>
        <price>999</price>
      </offer>
      <offer id="3">
        <vendorCode>B-3</vendorCode>
        <price>7,5</price>
        <stock_quantity>0</stock_quantity>
      </offer>
    </offers>
  </shop>
</yml_catalog>"#;

// ============================================================================
// Helpers
// ============================================================================

fn settings(server: &MockServer, extra: &[(&str, &str)]) -> Settings {
    let mut pairs: Vec<(String, String)> = vec![
        ("PROM_BASE_URL".into(), server.uri()),
        ("PROM_API_TOKEN".into(), "tok-123".into()),
        ("STATE_FILE".into(), String::new()),
    ];
    for (key, value) in extra {
        pairs.retain(|(k, _)| k != key);
        pairs.push((key.to_string(), value.to_string()));
    }
    Settings::resolve(FileConfig::default(), move |key| {
        pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    })
    .unwrap()
}

fn fast_retry() -> SyncOptions {
    SyncOptions {
        force: false,
        retry: Some(RetryPolicy::new(1, Duration::from_millis(10))),
    }
}

async fn serve_feed(server: &MockServer, route: &str, body: &str) -> Url {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
    Url::parse(&format!("{}{}", server.uri(), route)).unwrap()
}

async fn accept_all(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(EDIT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"processed_ids": []})))
        .mount(server)
        .await;
}

/// Every item sent to the edit endpoint, in request order.
async fn sent_items(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .flat_map(|r| {
            let batch: Vec<Value> = serde_json::from_slice(&r.body).unwrap();
            batch
        })
        .collect()
}

fn state_path(dir: &Path) -> String {
    dir.join("state.json").to_string_lossy().into_owned()
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
async fn test_sync_sends_deduplicated_updates() {
    let server = MockServer::start().await;
    let feed_a = serve_feed(&server, "/a.xml", FEED_A).await;
    let feed_b = serve_feed(&server, "/b.xml", FEED_B).await;
    accept_all(&server).await;

    let settings = settings(&server, &[]);
    let report = sync::run(&settings, &[feed_a, feed_b], &fast_retry())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.feeds_total, 2);
    assert_eq!(report.offers_parsed, 4);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.updates_planned, 3);
    assert_eq!(report.batches_total, 1);
    assert_eq!(report.updated, 3);

    let items = sent_items(&server).await;
    assert_eq!(
        items,
        vec![
            json!({"id": "SHOP_A-1", "price": 100.5, "quantity_in_stock": 3, "presence": "available"}),
            json!({"id": "SHOP_2", "price": 20.0, "presence": "not_available"}),
            json!({"id": "SHOP_B-3", "price": 7.5, "quantity_in_stock": 0, "presence": "not_available"}),
        ]
    );
}

#[tokio::test]
async fn test_dry_run_sends_nothing_and_needs_no_token() {
    let server = MockServer::start().await;
    let feed = serve_feed(&server, "/a.xml", FEED_A).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let state_file = state_path(dir.path());
    let settings = settings(
        &server,
        &[
            ("DRY_RUN", "true"),
            ("PROM_API_TOKEN", ""),
            ("STATE_FILE", &state_file),
        ],
    );

    let report = sync::run(&settings, &[feed], &fast_retry()).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.updates_planned, 2);
    assert_eq!(report.updated, 0);
    // A dry run never records fingerprints
    assert!(!dir.path().join("state.json").exists());
}

#[tokio::test]
async fn test_update_mode_limits_fields() {
    let server = MockServer::start().await;
    let feed = serve_feed(&server, "/a.xml", FEED_A).await;
    accept_all(&server).await;

    let settings = settings(&server, &[("UPDATE_MODE", "prices")]);
    sync::run(&settings, &[feed], &fast_retry()).await.unwrap();

    let items = sent_items(&server).await;
    assert_eq!(
        items,
        vec![
            json!({"id": "SHOP_A-1", "price": 100.5}),
            json!({"id": "SHOP_2", "price": 20.0}),
        ]
    );
}

#[tokio::test]
async fn test_failed_batch_does_not_stop_others() {
    let server = MockServer::start().await;
    let feed_a = serve_feed(&server, "/a.xml", FEED_A).await;
    let feed_b = serve_feed(&server, "/b.xml", FEED_B).await;

    Mock::given(method("POST"))
        .and(path(EDIT_PATH))
        .and(body_string_contains("SHOP_2"))
        .respond_with(ResponseTemplate::new(503))
        .with_priority(1)
        .mount(&server)
        .await;
    accept_all(&server).await;

    let settings = settings(&server, &[("BATCH_SIZE", "1"), ("MAX_CONCURRENT_REQUESTS", "2")]);
    let report = sync::run(&settings, &[feed_a, feed_b], &fast_retry())
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.batches_total, 3);
    assert_eq!(report.batches_failed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.updated, 2);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("503"));
}

#[tokio::test]
async fn test_rejections_are_counted_but_not_failures() {
    let server = MockServer::start().await;
    let feed = serve_feed(&server, "/a.xml", FEED_A).await;
    Mock::given(method("POST"))
        .and(path(EDIT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "processed_ids": [101],
            "errors": {"SHOP_2": "Product not found"}
        })))
        .mount(&server)
        .await;

    let settings = settings(&server, &[]);
    let report = sync::run(&settings, &[feed], &fast_retry()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.updated, 1);
    assert_eq!(report.rejected, 1);
}

#[tokio::test]
async fn test_failed_feed_is_reported_and_others_still_sent() {
    let server = MockServer::start().await;
    let good = serve_feed(&server, "/a.xml", FEED_A).await;
    Mock::given(method("GET"))
        .and(path("/missing.xml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let missing = Url::parse(&format!("{}/missing.xml", server.uri())).unwrap();
    accept_all(&server).await;

    let settings = settings(&server, &[]);
    let report = sync::run(&settings, &[missing, good], &fast_retry())
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.feeds_failed, 1);
    assert_eq!(report.updated, 2);
    assert!(report.errors[0].contains("missing.xml"));
}

// ============================================================================
// Change detection
// ============================================================================

#[tokio::test]
async fn test_unchanged_feeds_skip_push_until_forced() {
    let server = MockServer::start().await;
    let feed = serve_feed(&server, "/a.xml", FEED_A).await;
    accept_all(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let state_file = state_path(dir.path());
    let settings = settings(&server, &[("STATE_FILE", &state_file)]);
    let feeds = [feed];

    let first = sync::run(&settings, &feeds, &fast_retry()).await.unwrap();
    assert!(!first.unchanged);
    assert_eq!(first.updated, 2);

    let state = SyncState::load(Path::new(&state_file));
    assert_eq!(state.feeds.len(), 1);
    assert!(state.feeds.contains_key(feeds[0].as_str()));

    let second = sync::run(&settings, &feeds, &fast_retry()).await.unwrap();
    assert!(second.unchanged);
    assert!(second.is_success());
    assert_eq!(second.updated, 0);
    assert_eq!(sent_items(&server).await.len(), 2);

    let forced = SyncOptions {
        force: true,
        ..fast_retry()
    };
    let third = sync::run(&settings, &feeds, &forced).await.unwrap();
    assert!(!third.unchanged);
    assert_eq!(third.updated, 2);
    assert_eq!(sent_items(&server).await.len(), 4);
}

#[tokio::test]
async fn test_state_not_saved_when_batch_fails() {
    let server = MockServer::start().await;
    let feed = serve_feed(&server, "/a.xml", FEED_A).await;
    Mock::given(method("POST"))
        .and(path(EDIT_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let state_file = state_path(dir.path());
    let settings = settings(&server, &[("STATE_FILE", &state_file)]);

    let report = sync::run(&settings, &[feed], &fast_retry()).await.unwrap();

    assert_eq!(report.batches_failed, 1);
    assert!(!Path::new(&state_file).exists());
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn test_missing_token_fails_before_fetching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FEED_A))
        .expect(0)
        .mount(&server)
        .await;
    let feed = Url::parse(&format!("{}/a.xml", server.uri())).unwrap();

    let settings = settings(&server, &[("PROM_API_TOKEN", "")]);
    let result = sync::run(&settings, &[feed], &fast_retry()).await;

    let err = result.unwrap_err();
    assert!(matches!(err, SyncError::Config(ConfigError::MissingToken)));
    assert_eq!(exit_code_for(&err.into()), EXIT_CONFIG);
}

#[tokio::test]
async fn test_empty_feed_list_is_an_error() {
    let server = MockServer::start().await;
    let settings = settings(&server, &[]);

    let err = sync::run(&settings, &[], &fast_retry()).await.unwrap_err();
    assert!(matches!(err, SyncError::NoFeeds));
    assert_eq!(exit_code_for(&err.into()), EXIT_FAILURES);
}
