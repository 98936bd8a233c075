//! Ordered teardown.
//!
//! Steps run strictly in sequence, each under the same step timeout:
//! stop the scheduler, release the root subscriptions, disconnect every bot,
//! drain the feed pumps, disconnect the gateway, then close the store and
//! announce `ShutdownComplete`. A step that times out is logged and skipped so
//! the later steps still run. If stopping the scheduler times out, its loop is
//! aborted so no tick can reach the gateway after it disconnects.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::bus::{Event, EventBus};
use crate::gateway::Gateway;
use crate::state::StateStore;

use super::bots::BotRegistry;
use super::scheduler::RefreshScheduler;
use super::subscriptions::{Owner, SubscriptionLedger};

/// What happened during a shutdown, for the final log line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// True when an earlier call already did the work.
    pub already_complete: bool,
    pub unsubscribe_failures: Vec<String>,
    pub bot_failures: Vec<String>,
    pub pumps_aborted: usize,
    pub gateway_error: Option<String>,
    pub timed_out_steps: Vec<&'static str>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.unsubscribe_failures.is_empty()
            && self.bot_failures.is_empty()
            && self.gateway_error.is_none()
            && self.timed_out_steps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Live,
    Done,
}

pub struct ShutdownCoordinator {
    scheduler: RefreshScheduler,
    ledger: Arc<SubscriptionLedger>,
    registry: Arc<BotRegistry>,
    gateway: Arc<dyn Gateway>,
    store: StateStore,
    bus: Arc<EventBus>,
    step_timeout: Duration,
    drain_window: Duration,
    phase: Mutex<Phase>,
}

impl ShutdownCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: RefreshScheduler,
        ledger: Arc<SubscriptionLedger>,
        registry: Arc<BotRegistry>,
        gateway: Arc<dyn Gateway>,
        store: StateStore,
        bus: Arc<EventBus>,
        step_timeout: Duration,
        drain_window: Duration,
    ) -> Self {
        Self {
            scheduler,
            ledger,
            registry,
            gateway,
            store,
            bus,
            step_timeout,
            drain_window,
            phase: Mutex::new(Phase::Live),
        }
    }

    pub async fn is_complete(&self) -> bool {
        *self.phase.lock().await == Phase::Done
    }

    /// Tear everything down. Concurrent callers wait for the first one; every
    /// call after the first returns a report flagged `already_complete`.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut phase = self.phase.lock().await;
        if *phase == Phase::Done {
            return ShutdownReport {
                already_complete: true,
                ..ShutdownReport::default()
            };
        }

        tracing::info!("shutting down");
        let mut report = ShutdownReport::default();

        if self
            .step(&mut report, "stop scheduler", self.scheduler.stop())
            .await
            .is_none()
        {
            self.scheduler.abort();
        }

        if let Some(failures) = self
            .step(&mut report, "release root subscriptions", self.ledger.release_owner(&Owner::Root))
            .await
        {
            report.unsubscribe_failures = failures
                .into_iter()
                .map(|(key, err)| format!("{key}: {err}"))
                .collect();
        }

        if let Some(failures) = self
            .step(&mut report, "disconnect bots", self.registry.disconnect_all())
            .await
        {
            report.bot_failures = failures
                .into_iter()
                .map(|(name, err)| format!("{name}: {err}"))
                .collect();
        }
        self.registry.detach();

        if let Some(aborted) = self
            .step(&mut report, "drain feed pumps", self.ledger.drain(self.drain_window))
            .await
        {
            report.pumps_aborted = aborted;
        }

        if let Some(Err(err)) = self
            .step(&mut report, "disconnect gateway", self.gateway.disconnect())
            .await
        {
            tracing::warn!("gateway disconnect failed: {err}");
            report.gateway_error = Some(err.to_string());
        }

        self.store.close();
        *phase = Phase::Done;
        self.bus.publish(Event::ShutdownComplete);

        if report.is_clean() {
            tracing::info!("shutdown complete");
        } else {
            tracing::warn!(?report, "shutdown complete with problems");
        }
        report
    }

    async fn step<T>(
        &self,
        report: &mut ShutdownReport,
        name: &'static str,
        work: impl Future<Output = T>,
    ) -> Option<T> {
        tracing::debug!("shutdown step: {name}");
        match tokio::time::timeout(self.step_timeout, work).await {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("shutdown step '{name}' timed out after {:?}", self.step_timeout);
                report.timed_out_steps.push(name);
                None
            }
        }
    }
}
