//! Subscriptions and the delivery watermark.
//!
//! The watermark is the open time of the last bar handed to the consumer.
//! It only moves forward and only the delivering task moves it; any bar at
//! or before it is a duplicate and is refused.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use qsync_schemas::{Bar, SeriesKey};

// ---------------------------------------------------------------------------
// Watermark
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    last: Option<NaiveDateTime>,
}

impl Watermark {
    pub fn new(last: Option<NaiveDateTime>) -> Self {
        Self { last }
    }

    pub fn get(&self) -> Option<NaiveDateTime> {
        self.last
    }

    /// Strictly after the watermark.
    pub fn admits(&self, open_time: NaiveDateTime) -> bool {
        self.last.map_or(true, |w| open_time > w)
    }

    /// Advance to `open_time` if it is admitted. Returns whether it moved.
    pub fn advance(&mut self, open_time: NaiveDateTime) -> bool {
        if !self.admits(open_time) {
            return false;
        }
        self.last = Some(open_time);
        true
    }
}

// ---------------------------------------------------------------------------
// Feed status
// ---------------------------------------------------------------------------

/// Status pushed to the consumer alongside bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedStatus {
    /// History is being sent.
    Delayed,
    /// History delivered; waiting for live bars.
    Connected,
    /// Caught up; bars are live.
    Live,
    /// History-only feed finished, unsubscribed, or the session died.
    Disconnected,
}

/// One item on a consumer feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    Bar(Bar),
    Status(FeedStatus),
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Subscription {
    pub series: SeriesKey,
    pub active: bool,
    pub watermark: Watermark,
    /// Backfill delivered; live bars may flow.
    pub backfilled: bool,
    /// Missed live data (queue overflow or reconnect); refetch before resuming.
    pub needs_refetch: bool,
    pub status: FeedStatus,
}

impl Subscription {
    pub fn new(series: SeriesKey, watermark: Option<NaiveDateTime>) -> Self {
        Self {
            series,
            active: true,
            watermark: Watermark::new(watermark),
            backfilled: false,
            needs_refetch: false,
            status: FeedStatus::Delayed,
        }
    }

    /// Filter `bars` down to the ones not yet delivered, advancing the
    /// watermark over them. Input must be ascending.
    pub fn take_new(&mut self, bars: Vec<Bar>) -> Vec<Bar> {
        bars.into_iter()
            .filter(|b| self.watermark.advance(b.open_time))
            .collect()
    }

    /// Record a status change. Returns `true` when it differs from the last one.
    pub fn set_status(&mut self, status: FeedStatus) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use qsync_schemas::{InstrumentId, Timeframe};

    fn t(m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, m, 0)
            .unwrap()
    }

    #[test]
    fn watermark_is_strictly_monotonic() {
        let mut w = Watermark::default();
        assert!(w.advance(t(1)));
        assert!(!w.advance(t(1)), "equal is a duplicate");
        assert!(!w.advance(t(0)), "older never moves it back");
        assert!(w.advance(t(2)));
        assert_eq!(w.get(), Some(t(2)));
    }

    #[test]
    fn take_new_drops_delivered_bars() {
        let mut s = Subscription::new(
            SeriesKey::new(InstrumentId::new("TQBR", "SBER"), Timeframe::M1),
            Some(t(1)),
        );
        let bars: Vec<Bar> = (0..4).map(|m| Bar::opened(t(m), 1, 1)).collect();
        let out = s.take_new(bars);
        assert_eq!(out.iter().map(|b| b.open_time).collect::<Vec<_>>(), vec![t(2), t(3)]);
        assert!(s.take_new(vec![Bar::opened(t(3), 1, 1)]).is_empty());
    }

    #[test]
    fn status_changes_are_reported_once() {
        let mut s = Subscription::new(
            SeriesKey::new(InstrumentId::new("TQBR", "SBER"), Timeframe::M1),
            None,
        );
        assert!(!s.set_status(FeedStatus::Delayed));
        assert!(s.set_status(FeedStatus::Connected));
        assert!(!s.set_status(FeedStatus::Connected));
    }
}
