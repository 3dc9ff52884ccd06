//! End-to-end exporter/client tests over an in-memory duplex channel.

use benchlink::capability::builtin_registry;
use benchlink::capability::composite::Composite;
use benchlink::capability::power::{MockPower, PowerClient};
use benchlink::capability::serial::EchoSerial;
use benchlink::client::Client;
use benchlink::driver::DriverNode;
use benchlink::error::BenchError;
use benchlink::exporter::Session;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn bench_tree() -> DriverNode {
    DriverNode::new("bench", Arc::new(Composite))
        .with_label("board", "rpi4")
        .with_child(DriverNode::new("power", Arc::new(MockPower::default())))
        .with_child(DriverNode::new("serial", Arc::new(EchoSerial::default())))
}

/// Serve `root` over one half of an in-memory duplex and hand back a client
/// attached to the other half.
fn connected(root: DriverNode) -> (Client, Arc<Session>) {
    let session = Arc::new(Session::new(root).expect("tree must validate"));
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);

    let serving = Arc::clone(&session);
    tokio::spawn(async move {
        let _ = serving.serve(server_end).await;
    });

    let client = Client::connect(client_end, Arc::new(builtin_registry()));
    (client, session)
}

#[tokio::test]
async fn sync_reconstructs_the_exported_tree() {
    let root = bench_tree();
    let root_id = root.uuid();
    let (mut client, session) = connected(root);

    let tree = client.sync().await.unwrap();

    let bench = tree.root("bench").expect("root proxy");
    assert_eq!(bench.uuid(), root_id);
    assert_eq!(bench.labels().get("board").map(String::as_str), Some("rpi4"));
    assert_eq!(bench.capability(), "composite");

    let power = bench.child("power").expect("power proxy");
    assert_eq!(power.capability(), "power");
    let serial = bench.child("serial").expect("serial proxy");
    assert_eq!(serial.capability(), "serial");

    // Same shape as the served tree, node for node.
    assert_eq!(tree.iter().count(), session.root().post_order().len());
}

#[tokio::test]
async fn power_calls_round_trip_through_the_proxy() {
    let (mut client, _session) = connected(bench_tree());
    client.sync().await.unwrap();

    let power_proxy = client
        .tree()
        .root("bench")
        .and_then(|b| b.child("power"))
        .unwrap();
    let power: &PowerClient = power_proxy.client().expect("typed power client");

    power.on().await.unwrap();
    let reading = power.read().await.unwrap();
    assert!(reading.on);
    assert_eq!(reading.voltage, 5.0);

    power.off().await.unwrap();
    let reading = power.read().await.unwrap();
    assert!(!reading.on);
}

#[tokio::test]
async fn unknown_device_yields_typed_error() {
    let (client, _session) = connected(bench_tree());

    let bogus = Uuid::new_v4();
    let err = client
        .call(bogus, "on", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::UnknownDevice(_)));
}

#[tokio::test]
async fn unknown_stream_yields_typed_error() {
    let root = bench_tree();
    let serial_id = root
        .children()
        .iter()
        .find(|c| c.name() == "serial")
        .unwrap()
        .uuid();
    let (client, _session) = connected(root);

    let err = client
        .stub()
        .open_stream(serial_id, "video")
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::UnknownStream { .. }));
}

#[tokio::test]
async fn driver_failure_is_per_call_not_per_connection() {
    let root = bench_tree();
    let power_id = root
        .children()
        .iter()
        .find(|c| c.name() == "power")
        .unwrap()
        .uuid();
    let (client, _session) = connected(root);

    let err = client
        .call(power_id, "reboot", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::Driver { .. }));

    // The connection survives the failed call.
    client
        .call(power_id, "on", serde_json::Value::Null)
        .await
        .unwrap();
}

#[tokio::test]
async fn large_report_round_trips_in_order() {
    let mut root = DriverNode::new("rack", Arc::new(Composite));
    for i in 0..30 {
        let slot = DriverNode::new(format!("slot-{i}"), Arc::new(Composite))
            .with_child(DriverNode::new("power", Arc::new(MockPower::default())));
        root = root.with_child(slot);
    }
    let (client, _session) = connected(root);

    let records = client.get_report().await.unwrap();
    assert_eq!(records.len(), 61);

    // Every parent appears before its children.
    for (i, record) in records.iter().enumerate() {
        if let Some(parent) = record.parent {
            let parent_pos = records
                .iter()
                .position(|r| r.uuid == parent)
                .expect("parent present in report");
            assert!(parent_pos < i, "record {i} precedes its parent");
        }
    }
}

#[tokio::test]
async fn shutdown_ends_the_serving_loop() {
    let session = Arc::new(Session::new(bench_tree()).unwrap());
    let (client_end, server_end) = tokio::io::duplex(8192);

    let serving = Arc::clone(&session);
    let serve = tokio::spawn(async move { serving.serve(server_end).await });

    // Let the serving loop subscribe to the shutdown signal first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(2), serve)
        .await
        .expect("serve loop must observe shutdown")
        .unwrap();
    assert!(result.is_ok());
    drop(client_end);
}
