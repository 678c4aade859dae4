//! qsync-testkit
//!
//! Test doubles for scenario tests: [`MockBridge`], an in-process TCP bridge
//! with scripted command handlers, and JSON builders for the tables the bridge
//! exchanges.

pub mod bridge;
pub mod payloads;

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};

pub use bridge::{CandleBook, Handler, MockBridge, MockReply};

/// Timestamp on a fixed trading day (2024-03-01, a Friday).
pub fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .and_then(|d| d.and_hms_opt(h, m, s))
        .unwrap_or_default()
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
