//! Named bot workers.
//!
//! Bots share the root gateway connection. What a bot "holds" is whatever the
//! subscription ledger records under `Owner::Bot(name)`; the bot itself only
//! tracks whether it is connected and what it last reported.

use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

use crate::bus::{Event, EventBus, FeedUpdate, SubscriptionHandle, Topic};
use crate::gateway::{Gateway, GatewayError};
use crate::state::BotStatus;

use super::subscriptions::{Owner, SubscriptionError, SubscriptionKey, SubscriptionLedger};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BotError {
    #[error("bot {0} is not connected")]
    NotConnected(String),
    #[error("bot {0} received an empty command")]
    EmptyCommand(String),
    #[error("bot {name} could not cancel {count} subscription(s)")]
    ReleaseFailed { name: String, count: usize },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a bot named {0} already exists")]
    DuplicateName(String),
}

#[derive(Debug, Default)]
struct BotState {
    connected: bool,
    last_report: Option<String>,
    updates_seen: u64,
}

pub type BotHandle = Arc<Bot>;

pub struct Bot {
    name: String,
    gateway: Arc<dyn Gateway>,
    ledger: Arc<SubscriptionLedger>,
    bus: Arc<EventBus>,
    state: Mutex<BotState>,
}

impl Bot {
    fn new(
        name: String,
        gateway: Arc<dyn Gateway>,
        ledger: Arc<SubscriptionLedger>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            name,
            gateway,
            ledger,
            bus,
            state: Mutex::new(BotState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Owner {
        Owner::Bot(self.name.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state().connected
    }

    pub fn updates_seen(&self) -> u64 {
        self.lock_state().updates_seen
    }

    /// Attach to the shared gateway connection.
    pub async fn connect(&self) -> Result<(), BotError> {
        if !self.gateway.is_connected() {
            return Err(GatewayError::NotConnected.into());
        }
        let newly = !std::mem::replace(&mut self.lock_state().connected, true);
        if newly {
            tracing::info!(bot = %self.name, "bot connected");
            self.report("connected");
        }
        Ok(())
    }

    /// Release every subscription, then let go of the connection.
    ///
    /// Safe to call repeatedly; later calls find nothing to do.
    pub async fn disconnect(&self) -> Result<(), BotError> {
        let failures = self.release_subscriptions().await;
        let was_connected = std::mem::replace(&mut self.lock_state().connected, false);
        if was_connected {
            tracing::info!(bot = %self.name, "bot disconnected");
            self.bus
                .publish(Event::log(format!("bot {} disconnected", self.name)));
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BotError::ReleaseFailed {
                name: self.name.clone(),
                count: failures.len(),
            })
        }
    }

    pub async fn release_subscriptions(&self) -> Vec<(SubscriptionKey, GatewayError)> {
        self.ledger.release_owner(&self.owner()).await
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.ledger.owned_by(&self.owner())
    }

    /// Handle a line typed into the bot's input box.
    ///
    /// `SYM` starts ticks and bars for the contract, `stop SYM` stops them and
    /// `time` asks the gateway for its clock. Failures are reported on the log
    /// as well as returned.
    pub async fn on_message(&self, text: &str) -> Result<(), BotError> {
        let result = self.run_command(text.trim()).await;
        if let Err(err) = &result {
            self.report(&format!("error: {err}"));
        }
        result
    }

    async fn run_command(&self, text: &str) -> Result<(), BotError> {
        if text.is_empty() {
            return Err(BotError::EmptyCommand(self.name.clone()));
        }
        if !self.is_connected() {
            return Err(BotError::NotConnected(self.name.clone()));
        }

        let mut words = text.split_whitespace();
        match (words.next(), words.next()) {
            (Some(cmd), None) if cmd.eq_ignore_ascii_case("time") => {
                let now = self.gateway.request_current_time().await?;
                self.report(&format!("gateway time {}", now.format("%Y-%m-%d %H:%M:%S")));
            }
            (Some(cmd), Some(symbol)) if cmd.eq_ignore_ascii_case("stop") => {
                let symbol = symbol.to_ascii_uppercase();
                let owner = self.owner();
                self.ledger
                    .close(&owner, &SubscriptionKey::ticks(&symbol))
                    .await?;
                self.ledger
                    .close(&owner, &SubscriptionKey::bars(&symbol))
                    .await?;
                self.report(&format!("stopped {symbol}"));
            }
            (Some(symbol), None) => {
                let contract = self.gateway.qualify(&symbol.to_ascii_uppercase()).await?;
                let owner = self.owner();
                self.ledger
                    .open(owner.clone(), SubscriptionKey::ticks(&contract.symbol))
                    .await?;
                if let Err(err) = self
                    .ledger
                    .open(owner.clone(), SubscriptionKey::bars(&contract.symbol))
                    .await
                {
                    // Keep ticks and bars paired.
                    let ticks = SubscriptionKey::ticks(&contract.symbol);
                    if let Err(rollback) = self.ledger.close(&owner, &ticks).await {
                        tracing::warn!(bot = %self.name, key = %ticks, "rollback failed: {rollback}");
                        self.report(&format!("could not stop {ticks}: {rollback}"));
                    }
                    return Err(err.into());
                }
                self.report(&format!(
                    "streaming {} on {}",
                    contract.local_symbol, contract.exchange
                ));
            }
            _ => {
                let contract = self.gateway.qualify(&text.to_ascii_uppercase()).await?;
                self.report(&format!("qualified {}", contract.local_symbol));
            }
        }
        Ok(())
    }

    /// Called for every ticker, bar and account push on the bus.
    pub fn on_brokerage_update(&self, update: &FeedUpdate) {
        let relevant = match update.symbol() {
            Some(symbol) => self
                .subscriptions()
                .iter()
                .any(|key| key.covers(symbol)),
            None => true,
        };
        if relevant {
            self.lock_state().updates_seen += 1;
        }
    }

    pub fn status(&self) -> BotStatus {
        let subscriptions = self
            .subscriptions()
            .iter()
            .map(ToString::to_string)
            .collect();
        let state = self.lock_state();
        BotStatus {
            name: self.name.clone(),
            connected: state.connected,
            subscriptions,
            last_report: state.last_report.clone(),
        }
    }

    fn report(&self, text: &str) {
        self.lock_state().last_report = Some(text.to_string());
        self.bus.publish(Event::log(format!("[{}] {text}", self.name)));
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BotState> {
        self.state.lock().expect("bot state mutex poisoned")
    }
}

/// The set of bots, in insertion order.
pub struct BotRegistry {
    gateway: Arc<dyn Gateway>,
    ledger: Arc<SubscriptionLedger>,
    bus: Arc<EventBus>,
    bots: Mutex<Vec<BotHandle>>,
    forwarders: Mutex<Vec<SubscriptionHandle>>,
}

impl BotRegistry {
    /// Build the registry and start forwarding feed events to its bots.
    pub fn new(
        gateway: Arc<dyn Gateway>,
        ledger: Arc<SubscriptionLedger>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            gateway,
            ledger,
            bus: Arc::clone(&bus),
            bots: Mutex::new(Vec::new()),
            forwarders: Mutex::new(Vec::new()),
        });

        let handles: Vec<SubscriptionHandle> = [Topic::Ticker, Topic::Bars, Topic::Account]
            .into_iter()
            .map(|topic| {
                let weak: Weak<Self> = Arc::downgrade(&registry);
                bus.subscribe(topic, move |event| {
                    let (Some(registry), Some(update)) =
                        (weak.upgrade(), FeedUpdate::from_event(event))
                    else {
                        return;
                    };
                    registry.for_each(|bot| bot.on_brokerage_update(&update));
                })
            })
            .collect();
        *registry.forwarders.lock().expect("registry mutex poisoned") = handles;
        registry
    }

    pub fn add(&self, name: &str) -> Result<BotHandle, RegistryError> {
        let mut bots = self.lock_bots();
        if bots.iter().any(|bot| bot.name == name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        let bot = Arc::new(Bot::new(
            name.to_string(),
            Arc::clone(&self.gateway),
            Arc::clone(&self.ledger),
            Arc::clone(&self.bus),
        ));
        bots.push(Arc::clone(&bot));
        tracing::debug!(bot = %name, "bot added");
        Ok(bot)
    }

    pub fn get(&self, name: &str) -> Option<BotHandle> {
        self.lock_bots().iter().find(|bot| bot.name == name).cloned()
    }

    /// Disconnect and drop a bot. Removing an unknown name does nothing.
    pub async fn remove(&self, name: &str) -> Result<(), BotError> {
        let removed = {
            let mut bots = self.lock_bots();
            bots.iter()
                .position(|bot| bot.name == name)
                .map(|pos| bots.remove(pos))
        };
        match removed {
            Some(bot) => bot.disconnect().await,
            None => Ok(()),
        }
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&BotHandle),
    {
        let bots = self.snapshot();
        for bot in &bots {
            f(bot);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.lock_bots().iter().map(|bot| bot.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock_bots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statuses(&self) -> Vec<BotStatus> {
        self.snapshot().iter().map(|bot| bot.status()).collect()
    }

    /// Release every bot's subscriptions, then disconnect every bot. Failures
    /// are collected per bot; the sweep always visits all of them.
    pub async fn disconnect_all(&self) -> Vec<(String, BotError)> {
        let bots = self.snapshot();
        let mut failures = Vec::new();

        for bot in &bots {
            let failed = bot.release_subscriptions().await;
            if !failed.is_empty() {
                failures.push((
                    bot.name.clone(),
                    BotError::ReleaseFailed {
                        name: bot.name.clone(),
                        count: failed.len(),
                    },
                ));
            }
        }
        for bot in &bots {
            if let Err(err) = bot.disconnect().await {
                failures.push((bot.name.clone(), err));
            }
        }

        for (name, err) in &failures {
            tracing::warn!(bot = %name, "disconnect problem: {err}");
        }
        failures
    }

    /// Stop forwarding bus events to the bots.
    pub fn detach(&self) {
        let handles = std::mem::take(&mut *self.forwarders.lock().expect("registry mutex poisoned"));
        for handle in handles {
            if let Err(err) = self.bus.unsubscribe(handle) {
                tracing::warn!("registry forwarder already removed: {err}");
            }
        }
    }

    fn snapshot(&self) -> Vec<BotHandle> {
        self.lock_bots().clone()
    }

    fn lock_bots(&self) -> std::sync::MutexGuard<'_, Vec<BotHandle>> {
        self.bots.lock().expect("registry mutex poisoned")
    }
}
