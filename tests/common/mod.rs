// tests/common/mod.rs
//! Common test utilities for hydra integration tests.

#![allow(dead_code)]

pub mod mock_gateway;

use std::sync::Arc;
use std::time::Duration;

use hydra::bus::{Event, EventBus, Topic};
use hydra::gateway::{BarSettings, Gateway};
use hydra::runtime::{BotRegistry, SubscriptionLedger};
use hydra::state::{StateStore, WorldState};

pub use mock_gateway::{CallLog, MockGateway};

/// The core components wired the way the app wires them, minus the
/// scheduler.
pub struct Harness {
    pub gateway: Arc<MockGateway>,
    pub bus: Arc<EventBus>,
    pub store: StateStore,
    pub ledger: Arc<SubscriptionLedger>,
    pub registry: Arc<BotRegistry>,
}

pub async fn harness(universe: &[&str]) -> Harness {
    let gateway = Arc::new(MockGateway::new());
    gateway.connect("127.0.0.1", 7497, 0).await.unwrap();
    let dyn_gateway: Arc<dyn Gateway> = gateway.clone();

    let bus = Arc::new(EventBus::new());
    let store = StateStore::new(WorldState::with_universe(
        universe.iter().map(|s| s.to_string()).collect(),
    ));
    let ledger = Arc::new(SubscriptionLedger::new(
        Arc::clone(&dyn_gateway),
        store.clone(),
        Arc::clone(&bus),
        BarSettings {
            bar_size: Duration::from_secs(300),
            lookback: Duration::from_secs(3600),
        },
        8,
    ));
    let registry = BotRegistry::new(dyn_gateway, Arc::clone(&ledger), Arc::clone(&bus));

    Harness {
        gateway,
        bus,
        store,
        ledger,
        registry,
    }
}

/// Append `bot_disconnect:NAME` to `calls` whenever a bot announces its
/// disconnect, and `shutdown_complete` when shutdown finishes.
pub fn record_lifecycle(bus: &EventBus, calls: CallLog) {
    let on_log = Arc::clone(&calls);
    bus.subscribe(Topic::Log, move |event| {
        if let Event::Log(line) = event {
            if let Some(name) = line
                .text
                .strip_prefix("bot ")
                .and_then(|rest| rest.strip_suffix(" disconnected"))
            {
                on_log.lock().unwrap().push(format!("bot_disconnect:{name}"));
            }
        }
    });
    bus.subscribe(Topic::ShutdownComplete, move |_| {
        calls.lock().unwrap().push("shutdown_complete".to_string());
    });
}
