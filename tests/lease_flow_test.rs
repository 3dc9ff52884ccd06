//! Lease lifecycle over a live controller connection: matching, exclusivity,
//! release semantics and the environment handoff.

use benchlink::controller::{Controller, ExporterEntry, InMemoryInventory};
use benchlink::error::BenchError;
use benchlink::lease::{LeaseManager, LeaseState, LEASE_ENV};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

fn entry(name: &str, labels: &[(&str, &str)]) -> ExporterEntry {
    ExporterEntry {
        name: name.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        endpoint: format!("{name}:8787"),
        online: true,
    }
}

fn filter(labels: &[(&str, &str)]) -> HashMap<String, String> {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn lab_controller() -> Arc<Controller> {
    let inventory = Arc::new(InMemoryInventory::new());
    inventory
        .add(entry("e1", &[("board", "rpi4"), ("site", "lab-1")]))
        .await;
    inventory
        .add(entry("e2", &[("board", "rpi5"), ("site", "lab-1")]))
        .await;
    Arc::new(Controller::new(inventory))
}

/// Serve the controller over one half of a duplex and attach a manager to
/// the other. The watch sender keeps the serving loop alive.
fn connected(controller: &Arc<Controller>, client_id: &str) -> (LeaseManager, watch::Sender<bool>) {
    let (client_end, server_end) = tokio::io::duplex(8192);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let serving = Arc::clone(controller);
    tokio::spawn(async move {
        let _ = serving.serve_connection(server_end, shutdown_rx).await;
    });

    (LeaseManager::connect(client_end, client_id), shutdown_tx)
}

#[tokio::test]
async fn lease_lifecycle_over_the_wire() {
    let controller = lab_controller().await;
    let (manager, _guard) = connected(&controller, "ci-runner");

    let lease = manager
        .request_lease(filter(&[("board", "rpi4")]), Some("smoke"))
        .await
        .unwrap();
    assert_eq!(lease.state, LeaseState::Active);
    assert_eq!(lease.exporter.as_deref(), Some("e1"));
    assert_eq!(lease.endpoint.as_deref(), Some("e1:8787"));
    assert_eq!(lease.name.as_deref(), Some("smoke"));

    let listed = manager.list_leases().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, lease.id);

    manager.release_lease(lease.id).await.unwrap();
    let err = manager.release_lease(lease.id).await.unwrap_err();
    assert!(matches!(err, BenchError::LeaseNotFound(_)));
}

#[tokio::test]
async fn zero_match_surfaces_as_no_match() {
    let controller = lab_controller().await;
    let (manager, _guard) = connected(&controller, "ci-runner");

    let err = manager
        .request_lease(filter(&[("board", "imx8")]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::NoMatch));
    assert!(manager.list_leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn filter_selects_by_label_equality() {
    let controller = lab_controller().await;
    let (manager, _guard) = connected(&controller, "ci-runner");

    // Both exporters share site=lab-1; only e2 carries board=rpi5.
    let lease = manager
        .request_lease(filter(&[("site", "lab-1"), ("board", "rpi5")]), None)
        .await
        .unwrap();
    assert_eq!(lease.exporter.as_deref(), Some("e2"));
    manager.release_lease(lease.id).await.unwrap();
}

#[tokio::test]
async fn leases_are_exclusive_across_clients() {
    let controller = lab_controller().await;
    let (alice, _g1) = connected(&controller, "alice");
    let (bob, _g2) = connected(&controller, "bob");

    let held = alice
        .request_lease(filter(&[("board", "rpi4")]), None)
        .await
        .unwrap();

    let err = bob
        .request_lease(filter(&[("board", "rpi4")]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::NoMatch));

    // Bob cannot release what Alice holds.
    let err = bob.release_lease(held.id).await.unwrap_err();
    assert!(matches!(err, BenchError::NotOwned(_)));

    alice.release_lease(held.id).await.unwrap();
    bob.request_lease(filter(&[("board", "rpi4")]), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn release_all_reports_each_lease() {
    let inventory = Arc::new(InMemoryInventory::new());
    inventory.add(entry("e1", &[("board", "rpi4")])).await;
    inventory.add(entry("e2", &[("board", "rpi4")])).await;
    let controller = Arc::new(Controller::new(inventory));
    let (manager, _guard) = connected(&controller, "ci-runner");

    let a = manager
        .request_lease(filter(&[("board", "rpi4")]), None)
        .await
        .unwrap();
    let b = manager
        .request_lease(filter(&[("board", "rpi4")]), None)
        .await
        .unwrap();

    let outcomes = manager.release_all().await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.is_ok()));
    let ids: Vec<_> = outcomes.iter().map(|o| o.id).collect();
    assert!(ids.contains(&a.id) && ids.contains(&b.id));

    let active = manager
        .list_leases()
        .await
        .unwrap()
        .into_iter()
        .filter(|l| l.is_active())
        .count();
    assert_eq!(active, 0);
}

#[tokio::test]
async fn env_handoff_suppresses_auto_release() {
    let controller = lab_controller().await;
    let (manager, _guard) = connected(&controller, "ci-runner");

    // Without the env var, with_lease acquires and releases around the body.
    std::env::remove_var(LEASE_ENV);
    let seen = manager
        .with_lease(filter(&[("board", "rpi4")]), |lease| async move {
            assert!(lease.is_active());
            Ok::<_, BenchError>(lease.id)
        })
        .await
        .unwrap();
    let after = manager.list_leases().await.unwrap();
    let released = after.iter().find(|l| l.id == seen).unwrap();
    assert_eq!(released.state, LeaseState::Released);

    // With the env var naming a held lease, the body reuses it and the
    // lease stays active afterwards; it belongs to the outer owner.
    let held = manager
        .request_lease(filter(&[("board", "rpi4")]), None)
        .await
        .unwrap();
    std::env::set_var(LEASE_ENV, held.id.to_string());

    let reused = manager
        .with_lease(filter(&[("board", "rpi4")]), |lease| async move {
            Ok::<_, BenchError>(lease.id)
        })
        .await
        .unwrap();
    assert_eq!(reused, held.id);

    let still_held = manager
        .list_leases()
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.id == held.id)
        .unwrap();
    assert_eq!(still_held.state, LeaseState::Active);

    std::env::remove_var(LEASE_ENV);
    manager.release_lease(held.id).await.unwrap();
}
