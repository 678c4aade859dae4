//! qsync-md
//!
//! Market data: paged history assembly, live bar aggregation and the
//! per-subscription delivery watermark. No IO; the adapter supplies a
//! [`CandleSource`] and drives the aggregators from its market-data task.

pub mod aggregator;
pub mod history;
pub mod subscription;

pub use aggregator::{BarAggregator, CandleGate};
pub use history::{
    apply_filters, fetch_history, history_depth, is_complete, merge_first_seen, BarFilter,
    CandleSource, HistoryError, HistoryRequest, COMPLETION_SLACK_SECS,
};
pub use subscription::{FeedItem, FeedStatus, Subscription, Watermark};
