//! Long-running machinery: subscription ownership, bots, the refresh
//! scheduler and ordered shutdown.

pub mod bots;
pub mod scheduler;
pub mod shutdown;
pub mod subscriptions;

pub use bots::{Bot, BotError, BotHandle, BotRegistry, RegistryError};
pub use scheduler::{GatewayRefresher, RefreshScheduler, SchedulerError, SchedulerState, TickSource};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use subscriptions::{
    Owner, SubscriptionError, SubscriptionKey, SubscriptionKind, SubscriptionLedger,
};
