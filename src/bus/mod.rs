//! Event system connecting the gateway, the world state, bots and the renderer.
//!
//! The event bus provides:
//! - Topic-keyed publish-subscribe with synchronous, ordered delivery
//! - A broadcast tap for consumers that run on their own task
//! - Frame batching so the renderer repaints at a bounded rate
//!
//! # Architecture
//!
//! Events flow from producers → EventBus → handlers / RenderBatcher:
//! - `EventBus`: handler registry plus an in-memory broadcast tap
//! - `RenderBatcher`: coalesces tap events into at most one repaint per frame

mod batcher;
mod event_bus;
pub mod event_types;

pub use batcher::RenderBatcher;
pub use event_bus::{BusError, Envelope, EventBus, Handler, SubscriptionHandle};
pub use event_types::{
    AccountUpdate, BarsUpdate, ErrorEvent, Event, FeedUpdate, LogLine, TickerUpdate, TimeUpdate,
    Topic, UserCommand,
};
