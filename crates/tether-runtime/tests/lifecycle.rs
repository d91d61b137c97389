use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use tether_core::config::LifecycleConfig;
use tether_core::discovery::ClientSignal;
use tether_core::testing::{MemoryEnsemble, DEFAULT_EVENT_TIMEOUT};
use tether_core::{ServiceInstance, TetherError};
use tether_runtime::lifecycle::{current_port, resolve_address};
use tether_runtime::{LifecycleEvent, LifecycleState, ServiceLifecycle};

const INTERVAL: Duration = Duration::from_millis(50);

fn scenario_config() -> LifecycleConfig {
    let mut config = LifecycleConfig::new("host:2181", "svc-a")
        .with_retry_count(3)
        .with_base_path("/services")
        .with_port(8080);
    config.watchdog.interval_ms = INTERVAL.as_millis() as u64;
    config.watchdog.unregister_timeout_ms = 1000;
    config
}

fn config() -> LifecycleConfig {
    let mut config = scenario_config();
    config.server.advertise_address = Some("10.0.0.7".parse().unwrap());
    config
}

fn path_of(instance: &ServiceInstance) -> String {
    format!("/services/svc-a/{}", instance.id)
}

async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for lifecycle event")
        .expect("lifecycle event channel closed")
}

async fn wait_ready(rx: &mut broadcast::Receiver<LifecycleEvent>) -> ServiceInstance {
    loop {
        match next_event(rx).await {
            LifecycleEvent::Ready(instance) => return instance,
            LifecycleEvent::RegistrationFailed(e) => panic!("registration failed: {}", e),
            _ => continue,
        }
    }
}

async fn wait_reconnecting(rx: &mut broadcast::Receiver<LifecycleEvent>) -> u64 {
    loop {
        if let LifecycleEvent::Reconnecting { attempt } = next_event(rx).await {
            return attempt;
        }
    }
}

/// Count `Ready` events arriving within `window`.
async fn count_ready(rx: &mut broadcast::Receiver<LifecycleEvent>, window: Duration) -> usize {
    let deadline = Instant::now() + window;
    let mut count = 0;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if event.is_ready() {
            count += 1;
        }
    }
    count
}

async fn started(
    ensemble: &MemoryEnsemble,
    config: LifecycleConfig,
) -> (
    ServiceLifecycle,
    broadcast::Receiver<LifecycleEvent>,
    ServiceInstance,
) {
    let lifecycle = ServiceLifecycle::new(ensemble.factory());
    let mut events = lifecycle.subscribe();
    lifecycle.initialise(config).await.unwrap();
    let instance = wait_ready(&mut events).await;
    (lifecycle, events, instance)
}

#[tokio::test]
async fn test_scenario_connect_disconnect_reconnect() {
    let ensemble = MemoryEnsemble::new();
    let config = scenario_config();
    let expected_address = resolve_address(&config.server).await;
    let (lifecycle, mut events, first) = started(&ensemble, config).await;

    let instance = lifecycle.service_instance().unwrap();
    assert_eq!(instance, first);
    assert_eq!(instance.address, expected_address);
    assert_eq!(instance.port, current_port(8080));
    assert_eq!(instance.name, "svc-a");
    assert_eq!(ensemble.latest_client().unwrap().retry_count(), 3);
    assert_eq!(count_ready(&mut events, INTERVAL * 4).await, 0);

    let offline_at = Instant::now();
    ensemble.go_offline();
    assert_eq!(next_event(&mut events).await, LifecycleEvent::Disconnected);
    assert_eq!(wait_reconnecting(&mut events).await, 1);
    assert!(offline_at.elapsed() >= INTERVAL);
    assert!(lifecycle.is_initialised());
    assert!(!lifecycle.is_registered_service());
    assert!(lifecycle.service_instance().is_none());

    ensemble.go_online();
    let second = wait_ready(&mut events).await;
    assert_ne!(second.id, first.id);

    ensemble.assert_unregistered_before_next_register(&path_of(&first));
    assert_eq!(ensemble.entries(), vec![(path_of(&second), second.clone())]);
    assert_eq!(lifecycle.state(), LifecycleState::Connected);

    let attempts = lifecycle.reconnect_attempts();
    tokio::time::sleep(INTERVAL * 5).await;
    assert_eq!(lifecycle.reconnect_attempts(), attempts);
    assert_eq!(count_ready(&mut events, INTERVAL).await, 0);
}

#[tokio::test]
async fn test_single_registration_across_outages() {
    let ensemble = MemoryEnsemble::new();
    let (lifecycle, mut events, mut current) = started(&ensemble, config()).await;

    for _ in 0..3 {
        ensemble.go_offline();
        wait_reconnecting(&mut events).await;
        ensemble.go_online();

        let next = wait_ready(&mut events).await;
        assert_ne!(next.id, current.id);
        assert!(lifecycle.is_registered_service());
        assert_eq!(lifecycle.service_instance().unwrap().port, current_port(8080));
        assert_eq!(ensemble.entry_count(), 1);
        current = next;
    }

    let discovery = lifecycle.service_discovery().unwrap();
    assert_eq!(discovery.get_data(), Some(&current));
}

#[tokio::test]
async fn test_connected_while_registered_replaces_registration() {
    let ensemble = MemoryEnsemble::new();
    let (lifecycle, mut events, first) = started(&ensemble, config()).await;

    ensemble
        .latest_client()
        .unwrap()
        .emit(ClientSignal::Connected);
    let second = wait_ready(&mut events).await;

    assert_ne!(second.id, first.id);
    ensemble.assert_unregistered_before_next_register(&path_of(&first));
    assert_eq!(ensemble.unregistered_paths(), vec![path_of(&first)]);
    assert_eq!(ensemble.entry_count(), 1);
    assert_eq!(lifecycle.service_instance(), Some(second));
}

#[tokio::test]
async fn test_watchdog_fires_at_interval_until_connected() {
    let ensemble = MemoryEnsemble::new();
    let (lifecycle, mut events, _) = started(&ensemble, config()).await;

    let offline_at = Instant::now();
    ensemble.go_offline();
    for expected in 1..=3 {
        assert_eq!(wait_reconnecting(&mut events).await, expected);
    }
    assert!(offline_at.elapsed() >= INTERVAL * 3);
    assert_eq!(lifecycle.state(), LifecycleState::Reconnecting);

    // Each attempt builds a fresh client.
    assert!(ensemble.clients_created() >= 4);

    ensemble.go_online();
    wait_ready(&mut events).await;

    let attempts = lifecycle.reconnect_attempts();
    let clients = ensemble.clients_created();
    tokio::time::sleep(INTERVAL * 5).await;
    assert_eq!(lifecycle.reconnect_attempts(), attempts);
    assert_eq!(ensemble.clients_created(), clients);
}

#[tokio::test]
async fn test_reinitialise_keeps_one_subscription() {
    let ensemble = MemoryEnsemble::new();
    ensemble.go_offline();

    let lifecycle = ServiceLifecycle::new(ensemble.factory());
    let mut events = lifecycle.subscribe();
    lifecycle.initialise(config()).await.unwrap();
    lifecycle.initialise(config()).await.unwrap();

    ensemble.go_online();
    wait_ready(&mut events).await;
    assert_eq!(count_ready(&mut events, INTERVAL * 4).await, 0);

    assert_eq!(ensemble.clients_created(), 2);
    assert_eq!(ensemble.latest_client().unwrap().subscriber_count(), 1);
    assert_eq!(ensemble.entry_count(), 1);
}

#[tokio::test]
async fn test_reinitialise_while_connected() {
    let ensemble = MemoryEnsemble::new();
    let (lifecycle, mut events, first) = started(&ensemble, config()).await;

    lifecycle.initialise(config()).await.unwrap();
    let second = wait_ready(&mut events).await;
    assert_eq!(count_ready(&mut events, INTERVAL * 4).await, 0);

    assert_ne!(second.id, first.id);
    assert_eq!(ensemble.entry_count(), 1);
    assert_eq!(ensemble.latest_client().unwrap().subscriber_count(), 1);
    assert_eq!(lifecycle.service_instance(), Some(second));
}

#[tokio::test]
async fn test_close_leaves_remote_registration() {
    let ensemble = MemoryEnsemble::new();
    let (lifecycle, _events, _) = started(&ensemble, config()).await;

    lifecycle.close().await.unwrap();

    assert_eq!(lifecycle.state(), LifecycleState::Closed);
    assert!(lifecycle.client().is_none());
    assert!(lifecycle.service_instance().is_none());
    assert!(lifecycle.service_discovery().is_none());
    assert!(!lifecycle.is_registered_service());
    ensemble.assert_no_unregister();
    assert_eq!(ensemble.entry_count(), 1);

    // Signals after close are ignored.
    ensemble.go_offline();
    tokio::time::sleep(INTERVAL * 4).await;
    assert_eq!(lifecycle.reconnect_attempts(), 0);
    assert_eq!(lifecycle.state(), LifecycleState::Closed);
}

#[tokio::test]
async fn test_initialise_after_close_rearms() {
    let ensemble = MemoryEnsemble::new();
    let (lifecycle, mut events, _) = started(&ensemble, config()).await;

    lifecycle.close().await.unwrap();
    lifecycle.initialise(config()).await.unwrap();
    wait_ready(&mut events).await;

    assert_eq!(lifecycle.state(), LifecycleState::Connected);
    assert!(lifecycle.is_registered_service());
}

#[tokio::test]
async fn test_construction_failure_is_returned() {
    let ensemble = MemoryEnsemble::new();
    ensemble.fail_client_construction(true);
    let lifecycle = ServiceLifecycle::new(ensemble.factory());

    let result = lifecycle.initialise(config()).await;

    assert!(matches!(result, Err(TetherError::Client(_))));
    assert!(!lifecycle.is_initialised());
    assert_eq!(lifecycle.state(), LifecycleState::Uninitialised);
    assert!(lifecycle.client().is_none());
}

#[tokio::test]
async fn test_failed_reinitialise_keeps_registration() {
    let ensemble = MemoryEnsemble::new();
    let (lifecycle, _events, instance) = started(&ensemble, config()).await;
    let client = lifecycle.client().unwrap();

    ensemble.fail_client_construction(true);
    assert!(lifecycle.initialise(config()).await.is_err());

    assert_eq!(lifecycle.state(), LifecycleState::Connected);
    assert!(lifecycle.is_registered_service());
    assert_eq!(lifecycle.service_instance(), Some(instance));
    assert!(std::sync::Arc::ptr_eq(&lifecycle.client().unwrap(), &client));
}

#[tokio::test]
async fn test_reconnect_failure_retries_on_next_tick() {
    let ensemble = MemoryEnsemble::new();
    let (lifecycle, mut events, _) = started(&ensemble, config()).await;

    ensemble.go_offline();
    ensemble.fail_client_construction(true);
    wait_reconnecting(&mut events).await;
    wait_reconnecting(&mut events).await;
    let clients = ensemble.clients_created();

    ensemble.fail_client_construction(false);
    ensemble.go_online();
    wait_ready(&mut events).await;

    assert!(lifecycle.is_registered_service());
    assert!(ensemble.clients_created() >= clients);
    assert_eq!(ensemble.entry_count(), 1);
}

#[tokio::test]
async fn test_stale_unregister_failure_does_not_block() {
    let ensemble = MemoryEnsemble::new();
    let (lifecycle, mut events, first) = started(&ensemble, config()).await;

    ensemble.reject_unregister(true);
    ensemble.go_offline();
    wait_reconnecting(&mut events).await;
    ensemble.go_online();
    let second = wait_ready(&mut events).await;

    assert_eq!(ensemble.unregistered_paths(), vec![path_of(&first)]);
    assert!(lifecycle.is_registered_service());
    assert_eq!(lifecycle.service_instance(), Some(second));
    // The old entry is left behind.
    assert_eq!(ensemble.entry_count(), 2);
}

#[tokio::test]
async fn test_stalled_stale_unregister_times_out() {
    let ensemble = MemoryEnsemble::new();
    let mut config = config();
    config.watchdog.unregister_timeout_ms = 100;
    let (lifecycle, mut events, first) = started(&ensemble, config).await;

    ensemble.stall_unregister(true);
    ensemble.go_offline();
    wait_reconnecting(&mut events).await;
    ensemble.go_online();
    let second = wait_ready(&mut events).await;

    assert_eq!(ensemble.unregistered_paths(), vec![path_of(&first)]);
    assert_eq!(lifecycle.service_instance(), Some(second));
    assert_eq!(lifecycle.state(), LifecycleState::Connected);
    assert_eq!(ensemble.entry_count(), 2);
}

#[tokio::test]
async fn test_connect_then_disconnect_burst() {
    let ensemble = MemoryEnsemble::new();
    let mut config = config();
    config.watchdog.interval_ms = 60_000;
    let (lifecycle, mut events, first) = started(&ensemble, config).await;

    let client = ensemble.latest_client().unwrap();
    client.emit(ClientSignal::Connected);
    client.emit(ClientSignal::Disconnected);

    let second = wait_ready(&mut events).await;
    assert_ne!(second.id, first.id);
    assert_eq!(next_event(&mut events).await, LifecycleEvent::Disconnected);

    assert_eq!(lifecycle.state(), LifecycleState::Disconnected);
    assert!(!lifecycle.is_registered_service());
    assert!(lifecycle.service_instance().is_none());
    assert_eq!(ensemble.unregistered_paths(), vec![path_of(&first)]);
    assert_eq!(lifecycle.reconnect_attempts(), 0);
}

#[tokio::test]
async fn test_superseded_client_signals_are_ignored() {
    let ensemble = MemoryEnsemble::new();
    let (lifecycle, mut events, _) = started(&ensemble, config()).await;
    let old = ensemble.latest_client().unwrap();

    lifecycle.initialise(config()).await.unwrap();
    let current = wait_ready(&mut events).await;
    let registered = ensemble.registered_paths();

    assert!(old.is_closed());
    old.emit(ClientSignal::Connected);
    old.emit(ClientSignal::Disconnected);
    assert_eq!(count_ready(&mut events, INTERVAL * 4).await, 0);

    assert_eq!(ensemble.registered_paths(), registered);
    assert_eq!(lifecycle.state(), LifecycleState::Connected);
    assert_eq!(lifecycle.service_instance(), Some(current));
}

#[tokio::test]
async fn test_registration_failure_recovers_on_next_connect() {
    let ensemble = MemoryEnsemble::new();
    ensemble.reject_register(true);
    let lifecycle = ServiceLifecycle::new(ensemble.factory());
    let mut events = lifecycle.subscribe();
    lifecycle.initialise(config()).await.unwrap();

    loop {
        if let LifecycleEvent::RegistrationFailed(_) = next_event(&mut events).await {
            break;
        }
    }
    assert!(!lifecycle.is_registered_service());

    ensemble.reject_register(false);
    ensemble.go_offline();
    wait_reconnecting(&mut events).await;
    ensemble.go_online();
    wait_ready(&mut events).await;

    assert!(lifecycle.is_registered_service());
    ensemble.assert_no_unregister();
}

#[tokio::test]
async fn test_dependencies_exposed() {
    let ensemble = MemoryEnsemble::new();
    let config = config().with_dependencies(vec!["svc-b".into(), "svc-c".into()]);
    let (lifecycle, _events, _) = started(&ensemble, config).await;

    assert_eq!(
        lifecycle.service_dependencies(),
        vec!["svc-b".to_string(), "svc-c".to_string()]
    );
}
