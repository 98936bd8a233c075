//! Topic and payload definitions.
//!
//! Single source of truth for which topics exist and which payload each topic
//! carries. Every `Event` variant maps to exactly one `Topic`, so a handler
//! registered for a topic always sees the same payload shape.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::Bar;
use crate::state::PositionRow;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Time,
    Ticker,
    Bars,
    Account,
    Log,
    Error,
    UserCommand,
    StateChanged,
    ShutdownComplete,
}

impl Topic {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Ticker => "ticker",
            Self::Bars => "bars",
            Self::Account => "account",
            Self::Log => "log",
            Self::Error => "error",
            Self::UserCommand => "user_command",
            Self::StateChanged => "state_changed",
            Self::ShutdownComplete => "shutdown_complete",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Gateway clock, published when a tick commits a new reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeUpdate {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub symbol: String,
    pub last: f64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarsUpdate {
    pub symbol: String,
    /// Most recent bars, oldest first.
    pub bars: Vec<Bar>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub net_liquidation: f64,
    pub positions: Vec<PositionRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub text: String,
}

impl LogLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Brokerage error code; `None` for errors raised inside hydra itself.
    pub code: Option<i32>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "arg", rename_all = "snake_case")]
pub enum UserCommand {
    Quit,
    PauseToggle,
    Restart,
    SelectBot(String),
    SubmitText(String),
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload", rename_all = "snake_case")]
pub enum Event {
    Time(TimeUpdate),
    Ticker(TickerUpdate),
    Bars(BarsUpdate),
    Account(AccountUpdate),
    Log(LogLine),
    Error(ErrorEvent),
    UserCommand(UserCommand),
    StateChanged { revision: u64 },
    ShutdownComplete,
}

impl Event {
    pub const fn topic(&self) -> Topic {
        match self {
            Self::Time(_) => Topic::Time,
            Self::Ticker(_) => Topic::Ticker,
            Self::Bars(_) => Topic::Bars,
            Self::Account(_) => Topic::Account,
            Self::Log(_) => Topic::Log,
            Self::Error(_) => Topic::Error,
            Self::UserCommand(_) => Topic::UserCommand,
            Self::StateChanged { .. } => Topic::StateChanged,
            Self::ShutdownComplete => Topic::ShutdownComplete,
        }
    }

    pub fn log(text: impl Into<String>) -> Self {
        Self::Log(LogLine::new(text))
    }
}

/// The part of the event vocabulary a gateway stream is allowed to push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedUpdate {
    Ticker(TickerUpdate),
    Bars(BarsUpdate),
    Account(AccountUpdate),
}

impl FeedUpdate {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Ticker(update) => Some(&update.symbol),
            Self::Bars(update) => Some(&update.symbol),
            Self::Account(_) => None,
        }
    }

    /// Recover the feed update carried by a bus event, if it is one.
    pub fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::Ticker(update) => Some(Self::Ticker(update.clone())),
            Event::Bars(update) => Some(Self::Bars(update.clone())),
            Event::Account(update) => Some(Self::Account(update.clone())),
            _ => None,
        }
    }
}

impl From<FeedUpdate> for Event {
    fn from(value: FeedUpdate) -> Self {
        match value {
            FeedUpdate::Ticker(update) => Event::Ticker(update),
            FeedUpdate::Bars(update) => Event::Bars(update),
            FeedUpdate::Account(update) => Event::Account(update),
        }
    }
}

// ---------------------------------------------------------------------------
// Repaint policy
// ---------------------------------------------------------------------------

/// Returns true if this event should be painted right away instead of waiting
/// for the next frame.
pub fn should_repaint_immediately(event: &Event) -> bool {
    matches!(event.topic(), Topic::Error | Topic::ShutdownComplete)
}

/// Returns true if this event changes what the renderer shows at all.
pub fn marks_view_dirty(event: &Event) -> bool {
    !matches!(event.topic(), Topic::UserCommand)
}
