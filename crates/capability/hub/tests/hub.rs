use api_contract::ServerMessage;
use domain::{Channel, ModuleKind, PhysicalSample};
use kiln_hub::{DistributionHub, Frame, HubConfig};
use kiln_ingest::SampleSink;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn temperature(device_id: &str, value: f64, ts_ms: i64) -> PhysicalSample {
    let mut fields = BTreeMap::new();
    fields.insert("temperature".to_string(), value);
    PhysicalSample {
        device_id: device_id.to_string(),
        module_id: "temp".to_string(),
        device_type: "kiln".to_string(),
        kind: ModuleKind::Temperature,
        ts_ms,
        fields,
        valid: true,
    }
}

fn status(device_id: &str, error: f64) -> PhysicalSample {
    let mut fields = BTreeMap::new();
    fields.insert("done".to_string(), 1.0);
    fields.insert("busy".to_string(), 0.0);
    fields.insert("error".to_string(), error);
    fields.insert("status_code".to_string(), 0.0);
    PhysicalSample {
        device_id: device_id.to_string(),
        module_id: "status".to_string(),
        device_type: "feeder".to_string(),
        kind: ModuleKind::DigitalStatus,
        ts_ms: 1,
        fields,
        valid: true,
    }
}

fn parse(frame: &Frame) -> serde_json::Value {
    serde_json::from_str(frame).expect("json frame")
}

fn hub() -> DistributionHub {
    DistributionHub::new(HubConfig::default())
}

#[tokio::test(start_paused = true)]
async fn silent_subscriber_expires_others_unaffected() {
    let hub = hub();
    let (silent_tx, _silent_rx) = mpsc::channel(16);
    let (alive_tx, mut alive_rx) = mpsc::channel(16);
    let silent = hub.register(silent_tx);
    let alive = hub.register(alive_tx);
    hub.subscribe(silent, Channel::Realtime).expect("subscribe");
    hub.subscribe(alive, Channel::Realtime).expect("subscribe");
    assert_eq!(hub.connection_count(), 2);

    tokio::time::advance(Duration::from_secs(30)).await;
    hub.heartbeat(alive).expect("heartbeat");
    tokio::time::advance(Duration::from_secs(16)).await;

    let expired = hub.sweep_expired();
    assert_eq!(expired, vec![silent]);
    assert_eq!(hub.connection_count(), 1);
    assert!(!hub.is_registered(silent));

    assert_eq!(hub.ingest(temperature("kiln_1", 850.0, 1)), 1);
    let frame = alive_rx.recv().await.expect("frame");
    let value = parse(&frame);
    assert_eq!(value["type"], "realtime_data");
    assert_eq!(value["data"]["kiln_1"]["temp"]["fields"]["temperature"], 850.0);
}

#[tokio::test(start_paused = true)]
async fn exactly_at_timeout_is_still_alive() {
    let hub = hub();
    let (tx, _rx) = mpsc::channel(4);
    hub.register(tx);
    tokio::time::advance(Duration::from_secs(45)).await;
    assert!(hub.sweep_expired().is_empty());
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(hub.sweep_expired().len(), 1);
}

#[tokio::test]
async fn subscribe_seeds_current_snapshot() {
    let hub = hub();
    hub.ingest(temperature("kiln_1", 800.0, 1));
    hub.ingest(temperature("kiln_2", 810.0, 1));

    let (tx, mut rx) = mpsc::channel(4);
    let id = hub.register(tx);
    hub.subscribe(id, Channel::Realtime).expect("subscribe");

    let value = parse(&rx.recv().await.expect("seed"));
    assert_eq!(value["type"], "realtime_data");
    assert_eq!(value["success"], true);
    assert_eq!(value["source"], "plc");
    assert!(value["data"]["kiln_1"]["temp"].is_object());
    assert!(value["data"]["kiln_2"]["temp"].is_object());

    hub.subscribe(id, Channel::DeviceStatus).expect("subscribe");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn full_subscriber_is_evicted_without_blocking_others() {
    let hub = hub();
    let (slow_tx, _slow_rx) = mpsc::channel(1);
    let (fast_tx, mut fast_rx) = mpsc::channel(16);
    let slow = hub.register(slow_tx);
    let fast = hub.register(fast_tx);
    hub.subscribe(slow, Channel::Realtime).expect("subscribe");
    hub.subscribe(fast, Channel::Realtime).expect("subscribe");

    assert_eq!(hub.ingest(temperature("kiln_1", 1.0, 1)), 2);
    assert_eq!(hub.ingest(temperature("kiln_1", 2.0, 2)), 1);
    assert!(!hub.is_registered(slow));
    assert!(hub.is_registered(fast));

    assert!(fast_rx.recv().await.is_some());
    assert!(fast_rx.recv().await.is_some());
}

#[tokio::test]
async fn closed_subscriber_is_evicted() {
    let hub = hub();
    let (tx, rx) = mpsc::channel(4);
    let id = hub.register(tx);
    hub.subscribe(id, Channel::Realtime).expect("subscribe");
    drop(rx);
    assert_eq!(hub.ingest(temperature("kiln_1", 1.0, 1)), 0);
    assert_eq!(hub.connection_count(), 0);
}

#[tokio::test]
async fn channels_route_by_kind_with_summary() {
    let hub = hub();
    let (tx, mut rx) = mpsc::channel(8);
    let id = hub.register(tx);
    hub.subscribe(id, Channel::DeviceStatus).expect("subscribe");

    assert_eq!(hub.ingest(temperature("kiln_1", 1.0, 1)), 0);
    hub.ingest(status("feeder_1", 0.0));
    hub.ingest(status("feeder_2", 1.0));

    let _first = rx.recv().await.expect("first");
    let value = parse(&rx.recv().await.expect("second"));
    assert_eq!(value["type"], "device_status");
    assert_eq!(value["summary"]["total"], 2);
    assert_eq!(value["summary"]["normal"], 1);
    assert_eq!(value["summary"]["error"], 1);

    let summary = hub.status_summary();
    assert_eq!((summary.total, summary.normal, summary.error), (2, 1, 1));
}

#[tokio::test]
async fn publish_without_subscribers_delivers_nothing() {
    let hub = hub();
    let message = ServerMessage::Heartbeat { timestamp: 1 };
    assert_eq!(hub.publish(Channel::Realtime, &message), 0);

    let (tx, _rx) = mpsc::channel(4);
    let id = hub.register(tx);
    assert_eq!(hub.publish(Channel::Realtime, &message), 0);
    hub.subscribe(id, Channel::Realtime).expect("subscribe");
    assert!(hub.unsubscribe(id, Channel::Realtime).expect("unsubscribe"));
    assert_eq!(hub.publish(Channel::Realtime, &message), 0);
}

#[tokio::test]
async fn unknown_connection_is_rejected() {
    let hub = hub();
    let (tx, _rx) = mpsc::channel(4);
    let id = hub.register(tx);
    assert!(hub.unregister(id));
    assert!(!hub.unregister(id));
    assert!(hub.subscribe(id, Channel::Realtime).is_err());
    assert!(hub.heartbeat(id).is_err());
}

#[tokio::test]
async fn latest_accessors_track_snapshot() {
    let hub = hub();
    assert!(hub.latest("kiln_1", "temp").is_none());
    hub.ingest(temperature("kiln_1", 700.0, 1));
    hub.ingest(temperature("kiln_1", 710.0, 2));
    let latest = hub.latest("kiln_1", "temp").expect("latest");
    assert_eq!(latest.ts_ms, 2);
    assert_eq!(hub.latest_all().len(), 1);
}

#[tokio::test]
async fn lagged_queue_drops_oldest() {
    let hub = DistributionHub::new(HubConfig {
        queue_capacity: 2,
        ..HubConfig::default()
    });
    let (handle, rx) = hub.channel();
    for ts in 1..=5 {
        handle
            .publish(temperature("kiln_1", ts as f64, ts))
            .await
            .expect("publish");
    }
    let task = hub.spawn_ingest(rx, CancellationToken::new());
    drop(handle);
    task.await.expect("join");

    let latest = hub.latest("kiln_1", "temp").expect("latest");
    assert_eq!(latest.ts_ms, 5);
}

#[tokio::test(start_paused = true)]
async fn reemit_pushes_snapshot_repeatedly() {
    let hub = hub();
    hub.ingest(temperature("kiln_1", 900.0, 1));
    let (tx, mut rx) = mpsc::channel(64);
    let id = hub.register(tx);
    hub.subscribe(id, Channel::Realtime).expect("subscribe");
    let _seed = rx.recv().await.expect("seed");

    let cancel = CancellationToken::new();
    let task = hub.spawn_reemit(cancel.clone());
    tokio::time::sleep(Duration::from_millis(350)).await;
    cancel.cancel();
    task.await.expect("join");

    let mut frames = 0;
    while rx.try_recv().is_ok() {
        frames += 1;
    }
    assert!(frames >= 3, "frames = {frames}");
}
