//! Position table shown in the dashboard.
//!
//! The table joins the live portfolio with the configured symbol universe:
//! every held symbol gets a row, every configured symbol that is not held gets
//! a zero row, and the result is sorted by symbol.

use serde::{Deserialize, Serialize};

use crate::gateway::PortfolioItem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRow {
    pub symbol: String,
    pub quantity: f64,
    /// Per-unit cost, i.e. the brokerage cost divided by the multiplier.
    pub average_cost: f64,
    pub market_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
}

impl PositionRow {
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: 0.0,
            average_cost: 0.0,
            market_price: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Convert brokerage portfolio lines into display rows.
pub fn position_rows(portfolio: &[PortfolioItem]) -> Vec<PositionRow> {
    portfolio
        .iter()
        .map(|item| {
            let multiplier = if item.multiplier > 0.0 { item.multiplier } else { 1.0 };
            PositionRow {
                symbol: item.symbol.clone(),
                quantity: item.quantity,
                average_cost: round_to(item.average_cost / multiplier, 2),
                market_price: round_to(item.market_price, 2),
                unrealized_pnl: item.unrealized_pnl.round(),
                realized_pnl: item.realized_pnl.round(),
            }
        })
        .collect()
}

/// Add zero rows for unheld universe symbols and sort by symbol.
pub fn pad_with_universe(mut rows: Vec<PositionRow>, universe: &[String]) -> Vec<PositionRow> {
    for symbol in universe {
        if !rows.iter().any(|row| &row.symbol == symbol) {
            rows.push(PositionRow::flat(symbol.clone()));
        }
    }
    rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    rows
}

pub fn build_position_table(universe: &[String], portfolio: &[PortfolioItem]) -> Vec<PositionRow> {
    pad_with_universe(position_rows(portfolio), universe)
}
