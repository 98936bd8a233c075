// tests/shutdown_integration_test.rs
//! Ordered teardown against a recording gateway.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use common::{harness, record_lifecycle, Harness};
use hydra::bus::Topic;
use hydra::gateway::{Gateway, GatewayError};
use hydra::runtime::{
    Owner, RefreshScheduler, SchedulerState, ShutdownCoordinator, SubscriptionKey, TickSource,
};
use hydra::state::{StoreError, WorldState};

struct IdleSource;

#[async_trait]
impl TickSource for IdleSource {
    async fn refresh(&self, state: WorldState) -> Result<WorldState, GatewayError> {
        Ok(state)
    }
}

/// Takes longer than the shutdown step timeout used below.
struct SlowSource;

#[async_trait]
impl TickSource for SlowSource {
    async fn refresh(&self, mut state: WorldState) -> Result<WorldState, GatewayError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        state.paused = true;
        Ok(state)
    }
}

fn coordinator(h: &Harness) -> (RefreshScheduler, ShutdownCoordinator) {
    coordinator_with(h, Arc::new(IdleSource), Duration::from_secs(5))
}

fn coordinator_with(
    h: &Harness,
    source: Arc<dyn TickSource>,
    step_timeout: Duration,
) -> (RefreshScheduler, ShutdownCoordinator) {
    let scheduler = RefreshScheduler::new(
        h.store.clone(),
        Arc::clone(&h.bus),
        source,
        Duration::from_secs(3600),
    )
    .unwrap();
    let gateway: Arc<dyn Gateway> = h.gateway.clone();
    let coordinator = ShutdownCoordinator::new(
        scheduler.clone(),
        Arc::clone(&h.ledger),
        Arc::clone(&h.registry),
        gateway,
        h.store.clone(),
        Arc::clone(&h.bus),
        step_timeout,
        Duration::from_millis(20),
    );
    (scheduler, coordinator)
}

/// One root ticker plus one subscription for each of two bots.
async fn populated() -> Harness {
    let h = harness(&["MES", "MNQ"]).await;
    h.ledger
        .open(Owner::Root, SubscriptionKey::ticks("MES"))
        .await
        .unwrap();
    for (name, symbol) in [("alpha", "MNQ"), ("beta", "M2K")] {
        let bot = h.registry.add(name).unwrap();
        bot.connect().await.unwrap();
        h.ledger
            .open(bot.owner(), SubscriptionKey::ticks(symbol))
            .await
            .unwrap();
    }
    h
}

#[tokio::test]
async fn test_shutdown_runs_steps_in_order() {
    let h = populated().await;
    let (scheduler, coordinator) = coordinator(&h);
    scheduler.start().unwrap();
    record_lifecycle(&h.bus, h.gateway.call_log());
    h.gateway.take_calls();

    let report = coordinator.shutdown().await;

    assert!(report.is_clean(), "unexpected problems: {report:?}");
    assert!(!report.already_complete);
    assert_eq!(
        h.gateway.take_calls(),
        vec![
            "cancel:#1",
            "cancel:#2",
            "cancel:#3",
            "bot_disconnect:alpha",
            "bot_disconnect:beta",
            "disconnect",
            "shutdown_complete",
        ]
    );
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert!(h.ledger.is_empty());
    assert_eq!(h.gateway.open_streams(), 0);
}

#[tokio::test]
async fn test_second_shutdown_is_a_no_op() {
    let h = populated().await;
    let (_scheduler, coordinator) = coordinator(&h);
    record_lifecycle(&h.bus, h.gateway.call_log());

    coordinator.shutdown().await;
    h.gateway.take_calls();

    let again = coordinator.shutdown().await;
    assert!(again.already_complete);
    assert!(h.gateway.take_calls().is_empty());
    assert!(coordinator.is_complete().await);
}

#[tokio::test]
async fn test_concurrent_shutdowns_do_the_work_once() {
    let h = populated().await;
    let (_scheduler, coordinator) = coordinator(&h);
    h.gateway.take_calls();

    let (first, second) = tokio::join!(coordinator.shutdown(), coordinator.shutdown());
    assert_ne!(first.already_complete, second.already_complete);

    let calls = h.gateway.take_calls();
    assert_eq!(calls.iter().filter(|c| c.starts_with("cancel:")).count(), 3);
    assert_eq!(calls.iter().filter(|c| *c == "disconnect").count(), 1);
}

#[tokio::test]
async fn test_failed_cancel_does_not_stop_the_sweep() {
    let h = populated().await;
    let (_scheduler, coordinator) = coordinator(&h);
    // Root ticker is stream #1.
    h.gateway.fail_cancel(1);
    h.gateway.take_calls();

    let report = coordinator.shutdown().await;

    assert_eq!(report.unsubscribe_failures.len(), 1);
    assert!(report.unsubscribe_failures[0].starts_with("ticks:MES"));
    let calls = h.gateway.take_calls();
    assert_eq!(calls.iter().filter(|c| c.starts_with("cancel:")).count(), 3);
    assert_eq!(calls.last().map(String::as_str), Some("disconnect"));
    assert!(h.registry.statuses().iter().all(|bot| !bot.connected));
}

#[tokio::test]
async fn test_store_rejects_writes_after_shutdown() {
    let h = populated().await;
    let (_scheduler, coordinator) = coordinator(&h);
    coordinator.shutdown().await;

    let before = h.store.snapshot();
    let err = h
        .store
        .update(|state| state.paused = true)
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Closed);
    assert_eq!(*h.store.snapshot(), *before);
}

#[tokio::test]
async fn test_slow_tick_cannot_commit_after_shutdown() {
    let h = populated().await;
    let (scheduler, coordinator) =
        coordinator_with(&h, Arc::new(SlowSource), Duration::from_millis(50));
    record_lifecycle(&h.bus, h.gateway.call_log());
    let calls = h.gateway.call_log();
    h.bus.subscribe(Topic::StateChanged, move |_| {
        calls.lock().unwrap().push("state_changed".to_string());
    });

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.gateway.take_calls();

    let report = coordinator.shutdown().await;
    assert_eq!(report.timed_out_steps, vec!["stop scheduler"]);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    // Outlast the tick that was in flight.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let calls = h.gateway.take_calls();
    assert!(!calls.iter().any(|c| c == "state_changed"), "{calls:?}");
    assert_eq!(calls.last().map(String::as_str), Some("shutdown_complete"));
    assert_eq!(h.store.snapshot().revision, 0);
    assert!(!h.store.snapshot().paused);
}
