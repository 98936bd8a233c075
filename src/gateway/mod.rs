//! Brokerage gateway boundary.
//!
//! Everything hydra needs from a brokerage goes through the [`Gateway`] trait:
//! streaming subscriptions that yield [`FeedUpdate`]s, request/response calls
//! for time, positions and account summary, cancellation, and an error
//! notification channel. The wire protocol stays behind the implementation.
//!
//! [`SimulatedGateway`] is a paper implementation used by the binary when no
//! brokerage is attached.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::bus::FeedUpdate;

mod simulated;

pub use simulated::SimulatedGateway;

/// Identifier the gateway assigns to an open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GatewaySubscriptionId(pub u64);

impl fmt::Display for GatewaySubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An open stream. Dropping `updates` does not cancel the stream on the
/// gateway side; call [`Gateway::cancel`] with `id`.
pub struct Subscription {
    pub id: GatewaySubscriptionId,
    pub updates: BoxStream<'static, FeedUpdate>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub local_symbol: String,
    pub exchange: String,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One line of the live portfolio as the brokerage reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioItem {
    pub symbol: String,
    pub quantity: f64,
    /// Per-contract cost including the multiplier.
    pub average_cost: f64,
    pub market_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarSettings {
    pub bar_size: Duration,
    pub lookback: Duration,
}

/// Asynchronous error report pushed by the brokerage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayNotice {
    pub code: i32,
    pub message: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("gateway event loop is already stopping")]
    LoopStopping,
    #[error("not connected to gateway")]
    NotConnected,
    #[error("gateway error {code}: {message}")]
    Protocol { code: i32, message: String },
    #[error("unknown gateway subscription {0}")]
    UnknownSubscription(GatewaySubscriptionId),
    #[error("gateway connection lost: {0}")]
    Disconnected(String),
}

impl GatewayError {
    /// The two conditions that mean "try again on the next tick".
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::LoopStopping | GatewayError::NotConnected)
    }
}

/// Brokerage connection shared by the root component and every bot.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<(), GatewayError>;

    /// Close the connection. Calling it on a closed connection is not an error.
    async fn disconnect(&self) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;

    /// Resolve a user-typed symbol into a tradable contract.
    async fn qualify(&self, symbol: &str) -> Result<Contract, GatewayError>;

    async fn subscribe_ticks(&self, symbol: &str) -> Result<Subscription, GatewayError>;

    async fn subscribe_bars(
        &self,
        symbol: &str,
        settings: BarSettings,
    ) -> Result<Subscription, GatewayError>;

    async fn subscribe_account(&self) -> Result<Subscription, GatewayError>;

    async fn request_positions(&self) -> Result<Vec<PortfolioItem>, GatewayError>;

    async fn request_account_summary(&self) -> Result<BTreeMap<String, String>, GatewayError>;

    async fn request_current_time(&self) -> Result<DateTime<Utc>, GatewayError>;

    /// Stop a stream. Its `updates` end shortly after.
    async fn cancel(&self, id: GatewaySubscriptionId) -> Result<(), GatewayError>;

    /// Receiver for brokerage-reported errors.
    fn errors(&self) -> broadcast::Receiver<GatewayNotice>;
}
