//! Channel lifecycle and liquidity rebalancing control plane for Lightning
//! node clients.
//!
//! The crate keeps an enriched view of a node's channels, drives PSBT channel
//! funding, resolves channel closes against slow backends and executes
//! circular rebalances. The node itself is reached through the `Backend` trait.

mod backend;
mod channel;
mod close;
pub mod config;
mod enrichment;
mod errors;
mod funding;
mod race;
pub mod rebalance;
mod registry;
mod view;

#[cfg(test)]
mod tests;

pub use self::backend::*;
pub use self::channel::*;
pub use self::close::{close_channel, close_request_for, CloseOutcome};
pub use self::config::Config;
pub use self::enrichment::{AliasCache, ChannelTotals, Lookup, TaggedHtlc};
pub use self::errors::*;
pub use self::funding::*;
pub use self::race::{first_settled, Settled};
pub use self::rebalance::{
    available_channels, max_rebalance_amount, BalancePreview, PaymentReceipt, RebalanceEngine, RebalanceIntent,
    RebalanceOutcome, RebalanceProgress,
};
pub use self::registry::*;
pub use self::view::*;
