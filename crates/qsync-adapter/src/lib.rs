//! qsync-adapter
//!
//! Wires the session, market data, reconciler and store crates into one
//! [`QuikAdapter`] per bridge connection: bar feeds with backfill and live
//! bars, order submission and cancellation, account state and snapshots.

mod account;
mod adapter;
mod broker;
pub mod clock;
mod feed;
pub mod instruments;
mod links;
mod persist;
pub mod source;
mod trading;

pub use adapter::QuikAdapter;
pub use clock::TerminalClock;
pub use feed::{Feed, FeedOptions};
pub use instruments::InstrumentCache;

pub use qsync_md::{FeedItem, FeedStatus};
pub use qsync_reconcile::{Expiry, Order, OrderRequest, OrderStatus, OrderType, Position, ReconcilerView};
