use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::positions::{pad_with_universe, PositionRow};
use crate::bus::FeedUpdate;
use crate::gateway::Bar;

pub type Symbol = String;

/// What a bot looks like from the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotStatus {
    pub name: String,
    pub connected: bool,
    pub subscriptions: Vec<String>,
    pub last_report: Option<String>,
}

/// The single snapshot of everything the dashboard shows.
///
/// Only [`super::StateStore::apply`] produces new versions; readers hold
/// `Arc<WorldState>` copies that never change underneath them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    /// Bumped by the store on every committed mutation.
    pub revision: u64,
    pub system_time: Option<DateTime<Utc>>,
    /// Configured symbol universe.
    pub universe: Vec<Symbol>,
    pub last_prices: BTreeMap<Symbol, f64>,
    pub bars: BTreeMap<Symbol, Vec<Bar>>,
    pub positions: Vec<PositionRow>,
    pub account_summary: BTreeMap<String, String>,
    pub bots: Vec<BotStatus>,
    pub selected_bot: Option<String>,
    pub paused: bool,
}

impl WorldState {
    pub fn with_universe(universe: Vec<Symbol>) -> Self {
        let positions = pad_with_universe(Vec::new(), &universe);
        Self {
            universe,
            positions,
            ..Self::default()
        }
    }

    /// Fold one pushed update into this state, keeping at most `bars_tail`
    /// bars per symbol.
    pub fn record(&mut self, update: &FeedUpdate, bars_tail: usize) {
        match update {
            FeedUpdate::Ticker(ticker) => {
                self.last_prices.insert(ticker.symbol.clone(), ticker.last);
            }
            FeedUpdate::Bars(bars) => {
                let skip = bars.bars.len().saturating_sub(bars_tail);
                let tail: Vec<Bar> = bars.bars.iter().skip(skip).cloned().collect();
                if let Some(last) = tail.last() {
                    self.last_prices
                        .entry(bars.symbol.clone())
                        .or_insert(last.close);
                }
                self.bars.insert(bars.symbol.clone(), tail);
            }
            FeedUpdate::Account(account) => {
                self.account_summary.insert(
                    "NetLiquidation".to_string(),
                    format!("{:.2}", account.net_liquidation),
                );
                self.positions = pad_with_universe(account.positions.clone(), &self.universe);
            }
        }
    }

    pub fn bot(&self, name: &str) -> Option<&BotStatus> {
        self.bots.iter().find(|bot| bot.name == name)
    }
}
