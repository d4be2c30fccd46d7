use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use domain::Channel;
use kiln_codec::validate_schema;
use kiln_config::{AppConfig, parse_schema};
use kiln_gateway::acquisition::{Acquisition, ws_settings};
use kiln_gateway::create_router;
use kiln_storage::{FallbackLog, InMemoryFallbackLog, InMemoryHistoricalStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const SCHEMA: &str = r#"{
  "blocks": [
    { "block_id": 1, "name": "kiln", "size": 2, "start_offset": 0,
      "modules": [ { "module_id": "temp", "device_id": "kiln_1", "device_type": "rotary_kiln",
                     "kind": "temperature", "byte_offset": 0, "byte_length": 2 } ] },
    { "block_id": 8, "name": "weigh", "size": 14, "start_offset": 0,
      "modules": [ { "module_id": "weight", "device_id": "hopper_1", "device_type": "short_hopper",
                     "kind": "weight", "byte_offset": 0, "byte_length": 14 } ] },
    { "block_id": 9, "name": "status", "size": 4, "start_offset": 0,
      "modules": [ { "module_id": "state", "device_id": "hopper_1", "device_type": "short_hopper",
                     "kind": "digital_status", "byte_offset": 0, "byte_length": 4 } ] }
  ]
}"#;

fn simulated_config() -> AppConfig {
    AppConfig {
        simulated: true,
        sim_error_rate: 0.0,
        sim_seed: Some(7),
        poll_interval_ms: 10,
        flush_batch_size: 10_000,
        flush_interval_ms: 60_000,
        replay_interval_ms: 60_000,
        ..AppConfig::default()
    }
}

struct Harness {
    acquisition: Acquisition,
    store: Arc<InMemoryHistoricalStore>,
    fallback: Arc<InMemoryFallbackLog>,
}

fn start() -> Harness {
    let config = simulated_config();
    let schema = validate_schema(parse_schema(SCHEMA).expect("parse")).expect("validate");
    let store = Arc::new(InMemoryHistoricalStore::new());
    let fallback = Arc::new(InMemoryFallbackLog::new());
    let acquisition = Acquisition::start_with(
        &config,
        schema,
        store.clone(),
        fallback.clone(),
        CancellationToken::new(),
    );
    Harness {
        acquisition,
        store,
        fallback,
    }
}

async fn wait_for_modules(acquisition: &Acquisition, expected: usize) {
    for _ in 0..500 {
        let count: usize = acquisition
            .hub()
            .latest_all()
            .values()
            .map(|modules| modules.len())
            .sum();
        if count >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("modules never reached {expected}");
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    assert!(response.headers().contains_key("x-request-id"));
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, serde_json::from_slice(&bytes).expect("json"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_reports_link_and_latest_modules() {
    let harness = start();
    wait_for_modules(&harness.acquisition, 3).await;

    let state = harness
        .acquisition
        .app_state(ws_settings(&simulated_config()), CancellationToken::new());
    let app = create_router(state);

    let (status, body) = get_json(app.clone(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], Value::Bool(true));
    assert_eq!(body["link"]["connected"], Value::Bool(true));
    assert_eq!(body["modules"], Value::from(3));
    assert_eq!(body["connections"], Value::from(0));
    assert_eq!(body["fallback"]["pending"], Value::from(0));
    assert_eq!(body["fallback"]["exhausted"], Value::from(0));
    assert!(body["metrics"]["poll_cycles"].as_u64().expect("poll_cycles") >= 1);

    let (status, body) = get_json(app.clone(), "/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["hopper_1"]["weight"]["fields"]["weight"].is_number());
    assert!(body["kiln_1"]["temp"]["fields"]["temperature"].is_number());

    let (status, body) = get_json(app.clone(), "/latest/hopper_1/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], Value::from("digital_status"));

    let (status, body) = get_json(app, "/latest/hopper_1/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], Value::from("not_found"));

    harness.acquisition.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_flushes_buffered_samples() {
    let harness = start();
    wait_for_modules(&harness.acquisition, 3).await;
    assert!(harness.store.is_empty());

    let sink = harness.acquisition.sink().clone();
    harness.acquisition.shutdown().await;

    assert!(harness.store.len() >= 3);
    assert_eq!(sink.buffered().await, 0);
    assert_eq!(harness.fallback.depth().await.expect("depth"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribers_receive_pushed_frames() {
    let harness = start();
    wait_for_modules(&harness.acquisition, 3).await;

    let hub = harness.acquisition.hub().clone();
    let (tx, mut rx) = mpsc::channel(64);
    let id = hub.register(tx);
    hub.subscribe(id, Channel::DeviceStatus).expect("subscribe");

    let seed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("seed in time")
        .expect("seed frame");
    let seed: Value = serde_json::from_str(&seed).expect("json");
    assert_eq!(seed["type"], Value::from("device_status"));
    assert_eq!(seed["source"], Value::from("simulated"));
    assert_eq!(seed["summary"]["total"], Value::from(1));

    let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("push in time")
        .expect("push frame");
    let next: Value = serde_json::from_str(&next).expect("json");
    assert_eq!(next["type"], Value::from("device_status"));

    harness.acquisition.shutdown().await;
}

#[test]
fn shipped_device_schema_validates() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/device_schema.json");
    let schema = validate_schema(kiln_config::load_schema(path).expect("load")).expect("validate");
    assert_eq!(schema.blocks().len(), 5);
    assert_eq!(schema.modules().count(), 9);
}
