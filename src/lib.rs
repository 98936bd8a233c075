//! HYDRA trading dashboard core.
//!
//! Connects to a brokerage gateway, streams market data and account state into
//! one shared world snapshot, hosts named bots that own their own
//! subscriptions, and tears everything down in a fixed order on quit.
//!
//! # Architecture
//!
//! - `bus`: topic-keyed event bus plus the render batcher on its tap
//! - `state`: `WorldState` and the `StateStore` that serializes mutations
//! - `gateway`: brokerage boundary and the simulated paper gateway
//! - `runtime`: subscription ledger, bots, refresh scheduler, shutdown
//! - `ui`: renderer boundary, console renderer and command parsing
//! - `config` / `logging`: configuration loading and tracing setup

pub mod app;
pub mod bus;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod runtime;
pub mod state;
pub mod ui;

use std::sync::Arc;

use app::Hydra;
use config::HydraConfig;
use gateway::{Gateway, SimulatedGateway};
use logging::LogTail;
use ui::ConsoleRenderer;

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Config(#[from] config::ConfigError),
    #[error("{0}")]
    Gateway(#[from] gateway::GatewayError),
    #[error("{0}")]
    Store(#[from] state::StoreError),
    #[error("{0}")]
    Bus(#[from] bus::BusError),
    #[error("{0}")]
    Subscription(#[from] runtime::SubscriptionError),
    #[error("{0}")]
    Bot(#[from] runtime::BotError),
    #[error("{0}")]
    Registry(#[from] runtime::RegistryError),
    #[error("{0}")]
    Scheduler(#[from] runtime::SchedulerError),
    #[error("unknown bot {0}")]
    UnknownBot(String),
    #[error("no bot is selected")]
    NoBotSelected,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Application entry point
// ---------------------------------------------------------------------------

/// Load configuration, install logging and run the dashboard against the
/// simulated gateway on a single-threaded runtime.
pub fn run() -> Result<(), AppError> {
    let config = HydraConfig::load()?;
    let tail = Arc::new(LogTail::new(config.log_retention));
    logging::init_tracing(tail.clone(), config.log_file.as_deref())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let gateway = config
            .paper_holdings
            .iter()
            .fold(SimulatedGateway::new(config.feed_interval()), |gateway, (symbol, qty)| {
                gateway.with_holding(symbol, *qty)
            });
        let gateway: Arc<dyn Gateway> = Arc::new(gateway);

        let hydra = Hydra::launch(config, gateway, tail).await?;
        tracing::info!("hydra started");
        let report = hydra
            .run(Box::new(ConsoleRenderer::stdout(app::VISIBLE_LOG_LINES)))
            .await?;

        if report.is_clean() {
            tracing::info!("hydra stopped");
        } else {
            eprintln!("hydra stopped with problems: {report:?}");
        }
        Ok::<(), AppError>(())
    })
}
