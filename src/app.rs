//! The assembled dashboard.
//!
//! [`Hydra::launch`] wires the gateway, bus, store, ledger, bots, scheduler
//! and shutdown coordinator together. [`Hydra::run`] then drives the render
//! batcher, keyboard input and the command loop until the operator quits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::bus::{ErrorEvent, Event, EventBus, RenderBatcher, Topic, UserCommand};
use crate::config::HydraConfig;
use crate::gateway::{Gateway, GatewayNotice};
use crate::logging::LogSink;
use crate::runtime::{
    BotRegistry, GatewayRefresher, Owner, RefreshScheduler, SchedulerState, ShutdownCoordinator,
    ShutdownReport, SubscriptionKey, SubscriptionLedger,
};
use crate::state::{StateStore, WorldState};
use crate::ui::{spawn_input_reader, Renderer};
use crate::AppError;

/// Log lines shown under the dashboard.
pub const VISIBLE_LOG_LINES: usize = 12;

/// What the command loop should do after a command.
#[derive(Debug)]
pub enum Control {
    Continue,
    Exit(ShutdownReport),
}

pub struct Hydra {
    config: HydraConfig,
    bus: Arc<EventBus>,
    store: StateStore,
    ledger: Arc<SubscriptionLedger>,
    registry: Arc<BotRegistry>,
    scheduler: RefreshScheduler,
    coordinator: ShutdownCoordinator,
    log: Arc<dyn LogSink>,
    notice_pump: JoinHandle<()>,
}

impl Hydra {
    /// Connect, subscribe the universe and the account as the root owner,
    /// bring up the configured bots and start refreshing.
    ///
    /// If any step after connecting fails, everything opened so far is torn
    /// down through the shutdown coordinator before the error is returned.
    pub async fn launch(
        config: HydraConfig,
        gateway: Arc<dyn Gateway>,
        log: Arc<dyn LogSink>,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        bridge_log_topics(&bus, Arc::clone(&log));

        let store = StateStore::new(WorldState::with_universe(config.symbols.clone()));
        let ledger = Arc::new(SubscriptionLedger::new(
            Arc::clone(&gateway),
            store.clone(),
            Arc::clone(&bus),
            config.bar_settings(),
            config.bars_tail,
        ));
        let registry = BotRegistry::new(Arc::clone(&gateway), Arc::clone(&ledger), Arc::clone(&bus));
        let scheduler = RefreshScheduler::new(
            store.clone(),
            Arc::clone(&bus),
            Arc::new(GatewayRefresher::new(Arc::clone(&gateway), Arc::clone(&registry))),
            config.tick_interval(),
        )?;
        let coordinator = ShutdownCoordinator::new(
            scheduler.clone(),
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&gateway),
            store.clone(),
            Arc::clone(&bus),
            config.step_timeout(),
            config.drain_window(),
        );

        gateway
            .connect(&config.host, config.port, config.client_id)
            .await?;
        tracing::info!(host = %config.host, port = config.port, "gateway connected");

        let hydra = Self {
            notice_pump: spawn_notice_pump(gateway.errors(), Arc::clone(&bus)),
            config,
            bus,
            store,
            ledger,
            registry,
            scheduler,
            coordinator,
            log,
        };
        if let Err(err) = hydra.bring_up().await {
            tracing::error!("launch failed, tearing down: {err}");
            let report = hydra.shutdown().await;
            if !report.is_clean() {
                tracing::warn!(?report, "teardown after failed launch was not clean");
            }
            return Err(err);
        }
        Ok(hydra)
    }

    async fn bring_up(&self) -> Result<(), AppError> {
        for symbol in &self.config.symbols {
            if let Err(err) = self
                .ledger
                .open(Owner::Root, SubscriptionKey::ticks(symbol))
                .await
            {
                tracing::warn!(%symbol, "universe ticker not started: {err}");
            }
        }
        self.ledger
            .open(Owner::Root, SubscriptionKey::account())
            .await?;

        for name in &self.config.bots {
            let bot = self.registry.add(name)?;
            bot.connect().await?;
        }
        if let Some(first) = self.config.bots.first().cloned() {
            self.store
                .update(move |state| state.selected_bot = Some(first))
                .await?;
        }

        self.scheduler.start()?;
        self.bus.publish(Event::log(format!(
            "hydra started: {} symbol(s), {} bot(s)",
            self.config.symbols.len(),
            self.registry.len()
        )));
        Ok(())
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<BotRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<SubscriptionLedger> {
        &self.ledger
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub async fn dispatch(&self, command: UserCommand) -> Result<Control, AppError> {
        match command {
            UserCommand::Quit => return Ok(Control::Exit(self.shutdown().await)),
            UserCommand::PauseToggle => {
                let state = self.scheduler.toggle_pause().await?;
                self.bus.publish(Event::log(match state {
                    SchedulerState::Paused => "refresh paused",
                    _ => "refresh resumed",
                }));
            }
            UserCommand::Restart => {
                self.scheduler.start()?;
                self.bus.publish(Event::log("refresh restarted"));
            }
            UserCommand::SelectBot(name) => {
                if self.registry.get(&name).is_none() {
                    return Err(AppError::UnknownBot(name));
                }
                let committed = self
                    .store
                    .update(move |state| state.selected_bot = Some(name))
                    .await?;
                self.bus.publish(Event::StateChanged {
                    revision: committed.revision,
                });
            }
            UserCommand::SubmitText(text) => {
                let selected = self.store.snapshot().selected_bot.clone();
                let bot = selected
                    .and_then(|name| self.registry.get(&name))
                    .ok_or(AppError::NoBotSelected)?;
                bot.on_message(&text).await?;
            }
        }
        Ok(Control::Continue)
    }

    /// Run the ordered teardown. Later calls are no-ops.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.coordinator.shutdown().await;
        self.notice_pump.abort();
        report
    }

    /// Drive the dashboard until `Quit` or Ctrl-C. Always ends shut down.
    pub async fn run(self, renderer: Box<dyn Renderer>) -> Result<ShutdownReport, AppError> {
        let (tx, mut commands) = mpsc::unbounded_channel();
        let forwarder = self.bus.subscribe(Topic::UserCommand, move |event| {
            if let Event::UserCommand(command) = event {
                let _ = tx.send(command.clone());
            }
        });
        let batcher = RenderBatcher::start(
            self.bus.tap(),
            self.store.clone(),
            Arc::clone(&self.log),
            renderer,
            self.config.frame_interval(),
            VISIBLE_LOG_LINES,
        );
        let input = spawn_input_reader(Arc::clone(&self.bus));

        let mut report = None;
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match self.dispatch(command).await {
                        Ok(Control::Continue) => {}
                        Ok(Control::Exit(done)) => {
                            report = Some(done);
                            break;
                        }
                        Err(AppError::Bot(err)) => tracing::debug!("bot command failed: {err}"),
                        Err(err) => tracing::error!("command rejected: {err}"),
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    if let Err(err) = signal {
                        tracing::warn!("failed to listen for ctrl-c: {err}");
                    }
                    tracing::info!("interrupt received");
                    break;
                }
            }
        }

        let report = match report {
            Some(report) => report,
            None => self.shutdown().await,
        };
        input.abort();
        self.bus.unsubscribe(forwarder)?;
        if tokio::time::timeout(Duration::from_secs(1), batcher).await.is_err() {
            tracing::warn!("renderer did not finish its last frame");
        }
        Ok(report)
    }
}

/// Copy bus `Log` and `Error` events into the log sink.
fn bridge_log_topics(bus: &EventBus, log: Arc<dyn LogSink>) {
    let log_lines = Arc::clone(&log);
    bus.subscribe(Topic::Log, move |event| {
        if let Event::Log(line) = event {
            log_lines.append(&line.text);
        }
    });
    bus.subscribe(Topic::Error, move |event| {
        if let Event::Error(err) = event {
            match err.code {
                Some(code) => log.append(&format!("ERROR {code}: {}", err.message)),
                None => log.append(&format!("ERROR: {}", err.message)),
            }
        }
    });
}

/// Informational brokerage codes (farm status and the like), shown as plain
/// log lines instead of errors.
fn is_informational(notice: &GatewayNotice) -> bool {
    (2100..2200).contains(&notice.code)
}

fn spawn_notice_pump(
    mut notices: broadcast::Receiver<GatewayNotice>,
    bus: Arc<EventBus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    let message = match &notice.context {
                        Some(context) => format!("{} ({context})", notice.message),
                        None => notice.message.clone(),
                    };
                    if is_informational(&notice) {
                        bus.publish(Event::log(format!("gateway {}: {message}", notice.code)));
                    } else {
                        bus.publish(Event::Error(ErrorEvent {
                            code: Some(notice.code),
                            message,
                        }));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("dropped {n} gateway notices");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
