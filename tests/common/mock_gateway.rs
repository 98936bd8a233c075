// tests/common/mock_gateway.rs
//! Recording gateway for integration testing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};

use hydra::bus::FeedUpdate;
use hydra::gateway::{
    BarSettings, Contract, Gateway, GatewayError, GatewayNotice, GatewaySubscriptionId,
    PortfolioItem, Subscription,
};

/// Shared, ordered log of lifecycle calls. Tests may push their own entries
/// (for example from bus handlers) to check ordering across components.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// A gateway that records every lifecycle call (connect, subscribe, cancel,
/// disconnect) and lets tests push feed updates by hand.
pub struct MockGateway {
    calls: CallLog,
    connected: AtomicBool,
    next_id: AtomicU64,
    streams: Mutex<HashMap<GatewaySubscriptionId, mpsc::UnboundedSender<FeedUpdate>>>,
    failing_cancels: Mutex<HashSet<GatewaySubscriptionId>>,
    reject_account: AtomicBool,
    positions: Mutex<Vec<PortfolioItem>>,
    notices: broadcast::Sender<GatewayNotice>,
}

impl MockGateway {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(16);
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
            failing_cancels: Mutex::new(HashSet::new()),
            reject_account: AtomicBool::new(false),
            positions: Mutex::new(Vec::new()),
            notices,
        }
    }

    pub fn call_log(&self) -> CallLog {
        Arc::clone(&self.calls)
    }

    /// Drain the recorded calls.
    pub fn take_calls(&self) -> Vec<String> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    /// Make `cancel` fail for this stream id, once.
    pub fn fail_cancel(&self, id: u64) {
        self.failing_cancels
            .lock()
            .unwrap()
            .insert(GatewaySubscriptionId(id));
    }

    /// Make every `subscribe_account` fail with a protocol error.
    pub fn reject_account(&self) {
        self.reject_account.store(true, Ordering::SeqCst);
    }

    pub fn set_positions(&self, positions: Vec<PortfolioItem>) {
        *self.positions.lock().unwrap() = positions;
    }

    /// Push an update into an open stream. Returns false if it is closed.
    pub fn push(&self, id: u64, update: FeedUpdate) -> bool {
        let streams = self.streams.lock().unwrap();
        match streams.get(&GatewaySubscriptionId(id)) {
            Some(tx) => tx.send(update).is_ok(),
            None => false,
        }
    }

    pub fn open_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn notify(&self, code: i32, message: &str) {
        let _ = self.notices.send(GatewayNotice {
            code,
            message: message.to_string(),
            context: None,
        });
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    fn open(&self, label: String) -> Result<Subscription, GatewayError> {
        self.ensure_connected()?;
        let id = GatewaySubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().insert(id, tx);
        self.record(format!("{label} {id}"));

        let updates = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|update| (update, rx))
        })
        .boxed();
        Ok(Subscription { id, updates })
    }
}

fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 14, 30, 0).unwrap()
}

#[async_trait]
impl Gateway for MockGateway {
    async fn connect(&self, _host: &str, _port: u16, _client_id: i32) -> Result<(), GatewayError> {
        self.connected.store(true, Ordering::SeqCst);
        self.record("connect");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        self.connected.store(false, Ordering::SeqCst);
        self.streams.lock().unwrap().clear();
        self.record("disconnect");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn qualify(&self, symbol: &str) -> Result<Contract, GatewayError> {
        self.ensure_connected()?;
        let symbol = symbol.to_ascii_uppercase();
        if symbol.starts_with("ZZ") {
            return Err(GatewayError::Protocol {
                code: 200,
                message: "No security definition has been found for the request".into(),
            });
        }
        Ok(Contract {
            symbol: symbol.clone(),
            local_symbol: format!("{symbol}M4"),
            exchange: "CME".into(),
            multiplier: 5.0,
        })
    }

    async fn subscribe_ticks(&self, symbol: &str) -> Result<Subscription, GatewayError> {
        self.open(format!("subscribe_ticks:{symbol}"))
    }

    async fn subscribe_bars(
        &self,
        symbol: &str,
        _settings: BarSettings,
    ) -> Result<Subscription, GatewayError> {
        self.open(format!("subscribe_bars:{symbol}"))
    }

    async fn subscribe_account(&self) -> Result<Subscription, GatewayError> {
        if self.reject_account.load(Ordering::SeqCst) {
            self.record("subscribe_account rejected");
            return Err(GatewayError::Protocol {
                code: 321,
                message: "Error validating request: account updates".into(),
            });
        }
        self.open("subscribe_account".to_string())
    }

    async fn request_positions(&self) -> Result<Vec<PortfolioItem>, GatewayError> {
        self.ensure_connected()?;
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn request_account_summary(&self) -> Result<BTreeMap<String, String>, GatewayError> {
        self.ensure_connected()?;
        Ok(BTreeMap::from([(
            "NetLiquidation".to_string(),
            "25000.00".to_string(),
        )]))
    }

    async fn request_current_time(&self) -> Result<DateTime<Utc>, GatewayError> {
        self.ensure_connected()?;
        Ok(fixed_time())
    }

    async fn cancel(&self, id: GatewaySubscriptionId) -> Result<(), GatewayError> {
        self.record(format!("cancel:{id}"));
        if self.failing_cancels.lock().unwrap().remove(&id) {
            return Err(GatewayError::Disconnected("cancel rejected".into()));
        }
        match self.streams.lock().unwrap().remove(&id) {
            Some(_) => Ok(()),
            None => Err(GatewayError::UnknownSubscription(id)),
        }
    }

    fn errors(&self) -> broadcast::Receiver<GatewayNotice> {
        self.notices.subscribe()
    }
}
