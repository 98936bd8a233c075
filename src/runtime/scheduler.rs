//! Periodic refresh driver.
//!
//! One loop task per `Running` period. Each tick runs a [`TickSource`] inside
//! [`StateStore::apply`], so ticks never overlap with each other or with any
//! other writer. Pausing and stopping only interrupt the wait between ticks;
//! a tick that has started runs to completion.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use crate::bus::{ErrorEvent, Event, EventBus, TimeUpdate};
use crate::gateway::{Gateway, GatewayError};
use crate::state::{build_position_table, StateStore, StoreError, WorldState};

use super::bots::BotRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("refresh interval must be greater than zero")]
    ZeroInterval,
    #[error("cannot {action} a {from:?} scheduler")]
    InvalidTransition {
        from: SchedulerState,
        action: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Produces the next world state for one tick.
#[async_trait]
pub trait TickSource: Send + Sync {
    async fn refresh(&self, state: WorldState) -> Result<WorldState, GatewayError>;
}

/// Pulls time, account summary, portfolio and bot statuses from the gateway
/// and the registry.
pub struct GatewayRefresher {
    gateway: Arc<dyn Gateway>,
    registry: Arc<BotRegistry>,
}

impl GatewayRefresher {
    pub fn new(gateway: Arc<dyn Gateway>, registry: Arc<BotRegistry>) -> Self {
        Self { gateway, registry }
    }
}

#[async_trait]
impl TickSource for GatewayRefresher {
    async fn refresh(&self, mut state: WorldState) -> Result<WorldState, GatewayError> {
        state.system_time = Some(self.gateway.request_current_time().await?);
        state.account_summary = self.gateway.request_account_summary().await?;
        let portfolio = self.gateway.request_positions().await?;
        state.positions = build_position_table(&state.universe, &portfolio);
        state.bots = self.registry.statuses();
        Ok(state)
    }
}

/// Drives ticks at a fixed interval.
#[derive(Clone)]
pub struct RefreshScheduler {
    store: StateStore,
    bus: Arc<EventBus>,
    source: Arc<dyn TickSource>,
    interval: Duration,
    control: Arc<watch::Sender<SchedulerState>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Loop task a `stop` is currently waiting on.
    stopping: Arc<Mutex<Option<AbortHandle>>>,
}

impl RefreshScheduler {
    pub fn new(
        store: StateStore,
        bus: Arc<EventBus>,
        source: Arc<dyn TickSource>,
        interval: Duration,
    ) -> Result<Self, SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }
        let (control, _) = watch::channel(SchedulerState::Stopped);
        Ok(Self {
            store,
            bus,
            source,
            interval,
            control: Arc::new(control),
            task: Arc::new(Mutex::new(None)),
            stopping: Arc::new(Mutex::new(None)),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.control.borrow()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stopped → Running. The first tick fires immediately.
    pub fn start(&self) -> Result<(), SchedulerError> {
        self.transition("start", SchedulerState::Running, |from| {
            from == SchedulerState::Stopped
        })?;

        let handle = tokio::spawn(run_loop(
            self.store.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.source),
            self.interval,
            self.control.subscribe(),
            Arc::clone(&self.control),
        ));
        let previous = self
            .task
            .lock()
            .expect("scheduler mutex poisoned")
            .replace(handle);
        if let Some(previous) = previous {
            // A loop that stopped itself after a fatal tick.
            previous.abort();
        }
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "scheduler started");
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.transition("pause", SchedulerState::Paused, |from| {
            from == SchedulerState::Running
        })?;
        self.mirror_paused(true).await;
        tracing::info!("scheduler paused");
        Ok(())
    }

    /// Paused → Running. The next tick fires immediately.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.transition("resume", SchedulerState::Running, |from| {
            from == SchedulerState::Paused
        })?;
        self.mirror_paused(false).await;
        tracing::info!("scheduler resumed");
        Ok(())
    }

    pub async fn toggle_pause(&self) -> Result<SchedulerState, SchedulerError> {
        match self.state() {
            SchedulerState::Running => self.pause().await?,
            SchedulerState::Paused => self.resume().await?,
            SchedulerState::Stopped => {
                return Err(SchedulerError::InvalidTransition {
                    from: SchedulerState::Stopped,
                    action: "pause",
                })
            }
        }
        Ok(self.state())
    }

    /// Any state → Stopped, waiting for the loop task to exit. A tick already
    /// in progress is allowed to commit.
    pub async fn stop(&self) {
        self.control.send_replace(SchedulerState::Stopped);
        let handle = self.task.lock().expect("scheduler mutex poisoned").take();
        if let Some(handle) = handle {
            *self.stopping.lock().expect("scheduler mutex poisoned") = Some(handle.abort_handle());
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    tracing::error!("scheduler loop panicked: {err}");
                }
            }
            self.stopping.lock().expect("scheduler mutex poisoned").take();
        }
        tracing::debug!("scheduler stopped");
    }

    /// Stop without waiting. A tick in progress is cancelled and its draft is
    /// never committed.
    pub fn abort(&self) {
        self.control.send_replace(SchedulerState::Stopped);
        let handle = self.task.lock().expect("scheduler mutex poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let stopping = self.stopping.lock().expect("scheduler mutex poisoned").take();
        if let Some(stopping) = stopping {
            stopping.abort();
        }
        tracing::warn!("scheduler aborted");
    }

    fn transition(
        &self,
        action: &'static str,
        to: SchedulerState,
        allowed: impl Fn(SchedulerState) -> bool,
    ) -> Result<(), SchedulerError> {
        let mut rejected = None;
        self.control.send_if_modified(|state| {
            if allowed(*state) {
                *state = to;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        match rejected {
            Some(from) => Err(SchedulerError::InvalidTransition { from, action }),
            None => Ok(()),
        }
    }

    async fn mirror_paused(&self, paused: bool) {
        match self.store.update(move |state| state.paused = paused).await {
            Ok(state) => self.bus.publish(Event::StateChanged {
                revision: state.revision,
            }),
            Err(err) => tracing::debug!("could not record pause flag: {err}"),
        }
    }
}

async fn run_loop(
    store: StateStore,
    bus: Arc<EventBus>,
    source: Arc<dyn TickSource>,
    interval: Duration,
    mut control: watch::Receiver<SchedulerState>,
    state: Arc<watch::Sender<SchedulerState>>,
) {
    loop {
        let current = *control.borrow_and_update();
        match current {
            SchedulerState::Stopped => break,
            SchedulerState::Paused => {
                if control.changed().await.is_err() {
                    break;
                }
                continue;
            }
            SchedulerState::Running => {}
        }

        let started = Instant::now();
        let previous_time = store.snapshot().system_time;
        let source = Arc::clone(&source);
        match store
            .apply(move |draft| async move { source.refresh(draft).await })
            .await
        {
            Ok(committed) => {
                tracing::trace!(revision = committed.revision, "tick committed");
                if let Some(timestamp) = committed.system_time {
                    if committed.system_time != previous_time {
                        bus.publish(Event::Time(TimeUpdate { timestamp }));
                    }
                }
                bus.publish(Event::StateChanged {
                    revision: committed.revision,
                });
            }
            Err(err) if err.is_transient() => {
                tracing::debug!("tick skipped: {err}");
            }
            Err(err) if err.is_closed() => {
                tracing::debug!("store closed, refresh loop exiting");
                state.send_replace(SchedulerState::Stopped);
                break;
            }
            Err(err) => {
                tracing::error!("tick failed, stopping refresh: {err}");
                state.send_replace(SchedulerState::Stopped);
                let code = match &err {
                    StoreError::Gateway(GatewayError::Protocol { code, .. }) => Some(*code),
                    _ => None,
                };
                bus.publish(Event::Error(ErrorEvent {
                    code,
                    message: format!("refresh stopped at {}: {err}", Utc::now().format("%H:%M:%S")),
                }));
                break;
            }
        }

        let next_tick = started + interval;
        tokio::select! {
            _ = tokio::time::sleep_until(next_tick) => {}
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
