//! World state and the store that serializes every mutation of it.

mod positions;
mod store;
mod world;

pub use positions::{build_position_table, pad_with_universe, position_rows, PositionRow};
pub use store::{StateStore, StoreError};
pub use world::{BotStatus, Symbol, WorldState};
