use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{
    Bar, BarSettings, Contract, Gateway, GatewayError, GatewayNotice, GatewaySubscriptionId,
    PortfolioItem, Subscription,
};
use crate::bus::{AccountUpdate, BarsUpdate, FeedUpdate, TickerUpdate};
use crate::state::position_rows;

const NOTICE_CAPACITY: usize = 64;
const STREAM_CAPACITY: usize = 256;
const MAX_BAR_HISTORY: usize = 50;
const STARTING_CASH: f64 = 25_000.0;

/// Futures roots the paper gateway can qualify: (root, exchange, multiplier, start price).
const KNOWN_ROOTS: &[(&str, &str, f64, f64)] = &[
    ("MES", "CME", 5.0, 5000.0),
    ("ES", "CME", 50.0, 5000.0),
    ("MNQ", "CME", 2.0, 17500.0),
    ("NQ", "CME", 20.0, 17500.0),
    ("M2K", "CME", 5.0, 2050.0),
    ("RTY", "CME", 50.0, 2050.0),
    ("MYM", "CBOT", 0.5, 38500.0),
    ("YM", "CBOT", 5.0, 38500.0),
    ("CL", "NYMEX", 1000.0, 75.0),
    ("GC", "COMEX", 100.0, 2050.0),
];

fn lookup_root(symbol: &str) -> Option<(&'static str, &'static str, f64, f64)> {
    KNOWN_ROOTS
        .iter()
        .filter(|(root, ..)| symbol.starts_with(root))
        .max_by_key(|(root, ..)| root.len())
        .copied()
}

#[derive(Debug, Clone)]
struct Holding {
    symbol: String,
    quantity: f64,
    average_cost: f64,
    multiplier: f64,
}

/// Paper brokerage: deterministic random walks per symbol, periodic bars and
/// account pushes, no network.
pub struct SimulatedGateway {
    connected: AtomicBool,
    next_id: AtomicU64,
    tick_every: Duration,
    streams: Mutex<HashMap<GatewaySubscriptionId, JoinHandle<()>>>,
    prices: Arc<Mutex<BTreeMap<String, f64>>>,
    holdings: Arc<Mutex<Vec<Holding>>>,
    notices: broadcast::Sender<GatewayNotice>,
}

impl SimulatedGateway {
    pub fn new(tick_every: Duration) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            tick_every,
            streams: Mutex::new(HashMap::new()),
            prices: Arc::new(Mutex::new(BTreeMap::new())),
            holdings: Arc::new(Mutex::new(Vec::new())),
            notices,
        }
    }

    /// Seed a paper position so the position table has something to show.
    pub fn with_holding(self, symbol: &str, quantity: f64) -> Self {
        let symbol = symbol.trim().to_ascii_uppercase();
        if let Some((_, _, multiplier, start)) = lookup_root(&symbol) {
            self.holdings
                .lock()
                .expect("simulated gateway mutex poisoned")
                .push(Holding {
                    symbol,
                    quantity,
                    average_cost: start * multiplier,
                    multiplier,
                });
        }
        self
    }

    fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    fn notify(&self, code: i32, message: impl Into<String>, context: Option<String>) {
        let _ = self.notices.send(GatewayNotice {
            code,
            message: message.into(),
            context,
        });
    }

    fn current_price(&self, symbol: &str) -> f64 {
        let mut prices = self.prices.lock().expect("simulated gateway mutex poisoned");
        *prices
            .entry(symbol.to_string())
            .or_insert_with(|| lookup_root(symbol).map_or(100.0, |(_, _, _, start)| start))
    }

    fn portfolio(&self) -> Vec<PortfolioItem> {
        let holdings = self
            .holdings
            .lock()
            .expect("simulated gateway mutex poisoned")
            .clone();
        holdings
            .into_iter()
            .map(|holding| {
                let price = self.current_price(&holding.symbol);
                let unit_cost = holding.average_cost / holding.multiplier;
                PortfolioItem {
                    unrealized_pnl: (price - unit_cost) * holding.quantity * holding.multiplier,
                    realized_pnl: 0.0,
                    market_price: price,
                    symbol: holding.symbol,
                    quantity: holding.quantity,
                    average_cost: holding.average_cost,
                    multiplier: holding.multiplier,
                }
            })
            .collect()
    }

    /// Register a producer task and hand back its stream.
    fn open_stream<F>(&self, producer: F) -> Subscription
    where
        F: FnOnce(GatewaySubscriptionId, mpsc::Sender<FeedUpdate>) -> JoinHandle<()>,
    {
        let id = GatewaySubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let handle = producer(id, tx);
        self.streams
            .lock()
            .expect("simulated gateway mutex poisoned")
            .insert(id, handle);

        let updates = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|update| (update, rx))
        })
        .boxed();
        Subscription { id, updates }
    }
}

fn step_price(rng: &mut StdRng, price: f64) -> f64 {
    let ticks: i32 = rng.gen_range(-2..=2);
    (price + f64::from(ticks) * 0.25).max(0.25)
}

fn synthetic_bar(rng: &mut StdRng, time: DateTime<Utc>, open: f64) -> Bar {
    let close = step_price(rng, open);
    let spread = f64::from(rng.gen_range(0..=4u32)) * 0.25;
    Bar {
        time,
        open,
        high: open.max(close) + spread,
        low: (open.min(close) - spread).max(0.25),
        close,
        volume: f64::from(rng.gen_range(10..500u32)),
    }
}

#[async_trait]
impl Gateway for SimulatedGateway {
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<(), GatewayError> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("paper gateway connected ({host}:{port}, client {client_id})");
        self.notify(2104, "Market data farm connection is OK:paper", None);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut streams = self.streams.lock().expect("simulated gateway mutex poisoned");
            streams.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
        }
        tracing::info!("paper gateway disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn qualify(&self, symbol: &str) -> Result<Contract, GatewayError> {
        self.ensure_connected()?;
        let local_symbol = symbol.trim().to_ascii_uppercase();
        let Some((root, exchange, multiplier, _)) = lookup_root(&local_symbol) else {
            let message = "No security definition has been found for the request".to_string();
            self.notify(200, message.clone(), Some(local_symbol));
            return Err(GatewayError::Protocol { code: 200, message });
        };
        Ok(Contract {
            symbol: root.to_string(),
            local_symbol,
            exchange: exchange.to_string(),
            multiplier,
        })
    }

    async fn subscribe_ticks(&self, symbol: &str) -> Result<Subscription, GatewayError> {
        self.ensure_connected()?;
        let symbol = symbol.to_string();
        let prices = self.prices.clone();
        let tick_every = self.tick_every;
        let start = self.current_price(&symbol);

        Ok(self.open_stream(move |id, tx| {
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(id.0);
                let mut price = start;
                let mut interval = tokio::time::interval(tick_every);
                loop {
                    interval.tick().await;
                    price = step_price(&mut rng, price);
                    prices
                        .lock()
                        .expect("simulated gateway mutex poisoned")
                        .insert(symbol.clone(), price);
                    let update = FeedUpdate::Ticker(TickerUpdate {
                        symbol: symbol.clone(),
                        last: price,
                        size: f64::from(rng.gen_range(1..=10u32)),
                    });
                    if tx.send(update).await.is_err() {
                        break;
                    }
                }
            })
        }))
    }

    async fn subscribe_bars(
        &self,
        symbol: &str,
        settings: BarSettings,
    ) -> Result<Subscription, GatewayError> {
        self.ensure_connected()?;
        let symbol = symbol.to_string();
        let prices = self.prices.clone();
        let start = self.current_price(&symbol);
        // Paper bars close faster than real ones so the view moves.
        let period = settings.bar_size.min(self.tick_every * 8);
        let bar_secs = settings.bar_size.as_secs().max(1);
        let history = ((settings.lookback.as_secs() / bar_secs) as usize).min(MAX_BAR_HISTORY);

        Ok(self.open_stream(move |id, tx| {
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(id.0.wrapping_mul(31));
                let step = chrono::Duration::seconds(bar_secs as i64);
                let now = Utc::now();
                let mut bars: Vec<Bar> = Vec::with_capacity(MAX_BAR_HISTORY + 1);
                let mut open = start;
                for i in (1..=history).rev() {
                    let bar = synthetic_bar(&mut rng, now - step * i as i32, open);
                    open = bar.close;
                    bars.push(bar);
                }

                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    let open = prices
                        .lock()
                        .expect("simulated gateway mutex poisoned")
                        .get(&symbol)
                        .copied()
                        .unwrap_or(open);
                    bars.push(synthetic_bar(&mut rng, Utc::now(), open));
                    if bars.len() > MAX_BAR_HISTORY {
                        bars.remove(0);
                    }
                    let update = FeedUpdate::Bars(BarsUpdate {
                        symbol: symbol.clone(),
                        bars: bars.clone(),
                    });
                    if tx.send(update).await.is_err() {
                        break;
                    }
                }
            })
        }))
    }

    async fn subscribe_account(&self) -> Result<Subscription, GatewayError> {
        self.ensure_connected()?;
        let holdings = self.holdings.clone();
        let prices = self.prices.clone();
        let period = self.tick_every * 4;

        Ok(self.open_stream(move |_, tx| {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    let items: Vec<PortfolioItem> = {
                        let holdings = holdings.lock().expect("simulated gateway mutex poisoned");
                        let prices = prices.lock().expect("simulated gateway mutex poisoned");
                        holdings
                            .iter()
                            .map(|holding| {
                                let unit_cost = holding.average_cost / holding.multiplier;
                                let price = prices.get(&holding.symbol).copied().unwrap_or(unit_cost);
                                PortfolioItem {
                                    symbol: holding.symbol.clone(),
                                    quantity: holding.quantity,
                                    average_cost: holding.average_cost,
                                    market_price: price,
                                    unrealized_pnl: (price - unit_cost)
                                        * holding.quantity
                                        * holding.multiplier,
                                    realized_pnl: 0.0,
                                    multiplier: holding.multiplier,
                                }
                            })
                            .collect()
                    };
                    let unrealized: f64 = items.iter().map(|item| item.unrealized_pnl).sum();
                    let update = FeedUpdate::Account(AccountUpdate {
                        net_liquidation: STARTING_CASH + unrealized,
                        positions: position_rows(&items),
                    });
                    if tx.send(update).await.is_err() {
                        break;
                    }
                }
            })
        }))
    }

    async fn request_positions(&self) -> Result<Vec<PortfolioItem>, GatewayError> {
        self.ensure_connected()?;
        Ok(self.portfolio())
    }

    async fn request_account_summary(&self) -> Result<BTreeMap<String, String>, GatewayError> {
        self.ensure_connected()?;
        let unrealized: f64 = self.portfolio().iter().map(|item| item.unrealized_pnl).sum();
        let mut summary = BTreeMap::new();
        summary.insert("Currency".to_string(), "USD".to_string());
        summary.insert("TotalCashValue".to_string(), format!("{STARTING_CASH:.2}"));
        summary.insert(
            "NetLiquidation".to_string(),
            format!("{:.2}", STARTING_CASH + unrealized),
        );
        summary.insert("UnrealizedPnL".to_string(), format!("{unrealized:.2}"));
        summary.insert(
            "BuyingPower".to_string(),
            format!("{:.2}", (STARTING_CASH + unrealized) * 4.0),
        );
        Ok(summary)
    }

    async fn request_current_time(&self) -> Result<DateTime<Utc>, GatewayError> {
        self.ensure_connected()?;
        Ok(Utc::now())
    }

    async fn cancel(&self, id: GatewaySubscriptionId) -> Result<(), GatewayError> {
        let handle = self
            .streams
            .lock()
            .expect("simulated gateway mutex poisoned")
            .remove(&id);
        match handle {
            Some(handle) => {
                handle.abort();
                Ok(())
            }
            None => Err(GatewayError::UnknownSubscription(id)),
        }
    }

    fn errors(&self) -> broadcast::Receiver<GatewayNotice> {
        self.notices.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper() -> SimulatedGateway {
        SimulatedGateway::new(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn requests_fail_transiently_before_connect() {
        let gateway = paper();
        let err = gateway.request_current_time().await.unwrap_err();
        assert_eq!(err, GatewayError::NotConnected);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn qualify_resolves_futures_roots_and_rejects_the_rest() {
        let gateway = paper();
        gateway.connect("127.0.0.1", 7497, 0).await.unwrap();
        let mut notices = gateway.errors();

        let contract = gateway.qualify("mesm5").await.unwrap();
        assert_eq!(contract.symbol, "MES");
        assert_eq!(contract.local_symbol, "MESM5");
        assert_eq!(contract.exchange, "CME");
        assert_eq!(contract.multiplier, 5.0);

        let err = gateway.qualify("AAPL").await.unwrap_err();
        assert!(matches!(err, GatewayError::Protocol { code: 200, .. }));
        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.code, 200);
        assert_eq!(notice.context.as_deref(), Some("AAPL"));
    }

    #[tokio::test]
    async fn cancelled_stream_ends_and_cannot_be_cancelled_twice() {
        let gateway = paper();
        gateway.connect("127.0.0.1", 7497, 0).await.unwrap();

        let mut sub = gateway.subscribe_ticks("MES").await.unwrap();
        let first = sub.updates.next().await.expect("a tick");
        assert_eq!(first.symbol(), Some("MES"));

        gateway.cancel(sub.id).await.unwrap();
        while sub.updates.next().await.is_some() {}
        assert_eq!(
            gateway.cancel(sub.id).await,
            Err(GatewayError::UnknownSubscription(sub.id))
        );
    }

    #[tokio::test]
    async fn paper_holdings_show_up_in_positions() {
        let gateway = paper().with_holding("MES", 2.0);
        gateway.connect("127.0.0.1", 7497, 0).await.unwrap();

        let positions = gateway.request_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "MES");
        assert_eq!(positions[0].quantity, 2.0);

        let summary = gateway.request_account_summary().await.unwrap();
        assert_eq!(summary.get("Currency").map(String::as_str), Some("USD"));
        assert!(summary.contains_key("NetLiquidation"));

        gateway.disconnect().await.unwrap();
        gateway.disconnect().await.unwrap();
        assert!(!gateway.is_connected());
    }
}
