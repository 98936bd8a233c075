//! Subscription ownership ledger.
//!
//! The brokerage connection is shared, so every open stream is recorded here
//! under a [`SubscriptionKey`] together with the [`Owner`] that opened it. Each
//! stream gets a feed pump task that folds its updates into the state store and
//! republishes them on the bus.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::bus::{EventBus, FeedUpdate};
use crate::gateway::{BarSettings, Gateway, GatewayError, GatewaySubscriptionId};
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKind {
    Ticks,
    Bars,
    Account,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub kind: SubscriptionKind,
    /// `None` for account-wide streams.
    pub symbol: Option<String>,
}

impl SubscriptionKey {
    pub fn ticks(symbol: impl Into<String>) -> Self {
        Self {
            kind: SubscriptionKind::Ticks,
            symbol: Some(symbol.into()),
        }
    }

    pub fn bars(symbol: impl Into<String>) -> Self {
        Self {
            kind: SubscriptionKind::Bars,
            symbol: Some(symbol.into()),
        }
    }

    pub fn account() -> Self {
        Self {
            kind: SubscriptionKind::Account,
            symbol: None,
        }
    }

    pub fn covers(&self, symbol: &str) -> bool {
        self.symbol.as_deref() == Some(symbol)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SubscriptionKind::Ticks => "ticks",
            SubscriptionKind::Bars => "bars",
            SubscriptionKind::Account => "account",
        };
        match &self.symbol {
            Some(symbol) => write!(f, "{kind}:{symbol}"),
            None => f.write_str(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// The dashboard itself (universe tickers, account stream).
    Root,
    Bot(String),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Root => f.write_str("root"),
            Owner::Bot(name) => write!(f, "bot {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubscriptionError {
    #[error("{key} is already owned by {owner}")]
    AlreadyOwned { key: SubscriptionKey, owner: Owner },
    #[error("{key} is owned by {owner}, not {requested_by}")]
    NotOwned {
        key: SubscriptionKey,
        owner: Owner,
        requested_by: Owner,
    },
    #[error("no open subscription for {0}")]
    Unknown(SubscriptionKey),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

struct Entry {
    owner: Owner,
    gateway_id: GatewaySubscriptionId,
    pump: JoinHandle<()>,
}

pub struct SubscriptionLedger {
    gateway: Arc<dyn Gateway>,
    store: StateStore,
    bus: Arc<EventBus>,
    bar_settings: BarSettings,
    bars_tail: usize,
    entries: Mutex<BTreeMap<SubscriptionKey, Entry>>,
    /// Pumps of cancelled streams, awaited by [`SubscriptionLedger::drain`].
    draining: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionLedger {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        store: StateStore,
        bus: Arc<EventBus>,
        bar_settings: BarSettings,
        bars_tail: usize,
    ) -> Self {
        Self {
            gateway,
            store,
            bus,
            bar_settings,
            bars_tail,
            entries: Mutex::new(BTreeMap::new()),
            draining: Mutex::new(Vec::new()),
        }
    }

    /// Open the gateway stream for `key` on behalf of `owner`.
    pub async fn open(&self, owner: Owner, key: SubscriptionKey) -> Result<(), SubscriptionError> {
        self.ensure_free(&key)?;

        let subscription = match (key.kind, key.symbol.as_deref()) {
            (SubscriptionKind::Ticks, Some(symbol)) => self.gateway.subscribe_ticks(symbol).await?,
            (SubscriptionKind::Bars, Some(symbol)) => {
                self.gateway.subscribe_bars(symbol, self.bar_settings).await?
            }
            (SubscriptionKind::Account, _) => self.gateway.subscribe_account().await?,
            (_, None) => return Err(SubscriptionError::Unknown(key.clone())),
        };
        let gateway_id = subscription.id;

        // Someone may have claimed the key while the gateway call was in flight.
        if let Err(err) = self.ensure_free(&key) {
            if let Err(cancel_err) = self.gateway.cancel(gateway_id).await {
                tracing::warn!(%key, "failed to cancel duplicate stream {gateway_id}: {cancel_err}");
            }
            return Err(err);
        }

        let pump = self.spawn_pump(key.clone(), subscription.updates);
        tracing::debug!(%key, %owner, "subscription opened as {gateway_id}");
        self.entries.lock().expect("ledger mutex poisoned").insert(
            key,
            Entry {
                owner,
                gateway_id,
                pump,
            },
        );
        Ok(())
    }

    /// Cancel one stream. Only its owner may close it.
    pub async fn close(&self, owner: &Owner, key: &SubscriptionKey) -> Result<(), SubscriptionError> {
        let entry = {
            let mut entries = self.entries.lock().expect("ledger mutex poisoned");
            let Some(current) = entries.get(key) else {
                return Err(SubscriptionError::Unknown(key.clone()));
            };
            if &current.owner != owner {
                return Err(SubscriptionError::NotOwned {
                    key: key.clone(),
                    owner: current.owner.clone(),
                    requested_by: owner.clone(),
                });
            }
            entries.remove(key)
        };
        let Some(entry) = entry else {
            return Err(SubscriptionError::Unknown(key.clone()));
        };

        self.park(entry.pump);
        self.gateway.cancel(entry.gateway_id).await?;
        tracing::debug!(%key, %owner, "subscription closed");
        Ok(())
    }

    /// Cancel every stream held by `owner` and return the cancels that failed.
    ///
    /// Keys leave the ledger before any cancel is issued, so a concurrent
    /// release of the same owner cannot cancel a stream twice.
    pub async fn release_owner(&self, owner: &Owner) -> Vec<(SubscriptionKey, GatewayError)> {
        let released: Vec<(SubscriptionKey, Entry)> = {
            let mut entries = self.entries.lock().expect("ledger mutex poisoned");
            let keys: Vec<SubscriptionKey> = entries
                .iter()
                .filter(|(_, entry)| &entry.owner == owner)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        let mut failures = Vec::new();
        for (key, entry) in released {
            self.park(entry.pump);
            if let Err(err) = self.gateway.cancel(entry.gateway_id).await {
                tracing::warn!(%key, %owner, "cancel failed: {err}");
                failures.push((key, err));
            }
        }
        failures
    }

    pub fn owned_by(&self, owner: &Owner) -> Vec<SubscriptionKey> {
        let entries = self.entries.lock().expect("ledger mutex poisoned");
        entries
            .iter()
            .filter(|(_, entry)| &entry.owner == owner)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn owner_of(&self, key: &SubscriptionKey) -> Option<Owner> {
        let entries = self.entries.lock().expect("ledger mutex poisoned");
        entries.get(key).map(|entry| entry.owner.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("ledger mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `window` for cancelled pumps to finish, then abort the rest.
    /// Returns how many had to be aborted.
    pub async fn drain(&self, window: Duration) -> usize {
        let pumps: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.draining.lock().expect("ledger mutex poisoned"));
        if pumps.is_empty() {
            return 0;
        }

        let aborts: Vec<_> = pumps.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(window, futures::future::join_all(pumps))
            .await
            .is_ok()
        {
            return 0;
        }

        let mut aborted = 0;
        for handle in aborts {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        tracing::warn!("aborted {aborted} feed pump(s) after the drain window");
        aborted
    }

    fn ensure_free(&self, key: &SubscriptionKey) -> Result<(), SubscriptionError> {
        let entries = self.entries.lock().expect("ledger mutex poisoned");
        match entries.get(key) {
            Some(entry) => Err(SubscriptionError::AlreadyOwned {
                key: key.clone(),
                owner: entry.owner.clone(),
            }),
            None => Ok(()),
        }
    }

    fn park(&self, pump: JoinHandle<()>) {
        self.draining
            .lock()
            .expect("ledger mutex poisoned")
            .push(pump);
    }

    fn spawn_pump(
        &self,
        key: SubscriptionKey,
        mut updates: BoxStream<'static, FeedUpdate>,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let bus = Arc::clone(&self.bus);
        let bars_tail = self.bars_tail;

        tokio::spawn(async move {
            while let Some(update) = updates.next().await {
                let recorded = update.clone();
                match store
                    .update(move |state| state.record(&recorded, bars_tail))
                    .await
                {
                    Ok(_) => {}
                    Err(err) if err.is_closed() => break,
                    Err(err) => tracing::debug!(%key, "dropped feed update: {err}"),
                }
                bus.publish(update.into());
            }
            tracing::debug!(%key, "feed pump finished");
        })
    }
}
