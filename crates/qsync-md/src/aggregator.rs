//! Live bar building.
//!
//! [`BarAggregator`] folds trade ticks into the in-progress bar of one series
//! and completes it when a tick lands in a later bucket. [`CandleGate`] is
//! the alternative live source: it takes the terminal's own candle pushes and
//! releases each candle once it has closed.
//!
//! Both stay closed until the subscription's backfill has been delivered,
//! and neither ever emits at or before the bucket they were opened at.

use chrono::NaiveDateTime;
use tracing::debug;

use qsync_schemas::{Bar, SeriesKey, Tick};

use crate::history::is_complete;

// ---------------------------------------------------------------------------
// Ticks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BarAggregator {
    series: SeriesKey,
    drop_doji: bool,
    open: bool,
    /// Buckets at or before this are done.
    floor: Option<NaiveDateTime>,
    current: Option<Bar>,
}

impl BarAggregator {
    pub fn new(series: SeriesKey, drop_doji: bool) -> Self {
        Self {
            series,
            drop_doji,
            open: false,
            floor: None,
            current: None,
        }
    }

    pub fn series(&self) -> &SeriesKey {
        &self.series
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn current(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    /// Open the gate after backfill. `watermark` is the last delivered bar;
    /// `seed` an in-progress bar from history for the bucket after it.
    pub fn start(&mut self, watermark: Option<NaiveDateTime>, seed: Option<Bar>) {
        self.open = true;
        self.floor = watermark;
        self.current = seed.filter(|b| watermark.map_or(true, |w| b.open_time > w));
    }

    /// Close the gate and forget the in-progress bar (connection lost). The
    /// next backfill reopens it.
    pub fn suspend(&mut self) {
        self.open = false;
        self.current = None;
    }

    /// Fold one tick in. Returns the bar it completed, if any.
    pub fn on_tick(&mut self, tick: &Tick) -> Option<Bar> {
        if !self.open || tick.instrument != self.series.instrument {
            return None;
        }
        let bucket = self.series.timeframe.bucket_start(tick.ts);
        if self.floor.is_some_and(|f| bucket <= f) {
            return None;
        }

        let Some(cur) = self.current.as_mut() else {
            self.current = Some(Bar::opened(bucket, tick.price, tick.volume));
            return None;
        };
        if bucket < cur.open_time {
            // Late tick for a bucket already moved past.
            return None;
        }
        if bucket == cur.open_time {
            cur.update(tick.price, tick.volume);
            return None;
        }

        let done = std::mem::replace(cur, Bar::opened(bucket, tick.price, tick.volume));
        self.floor = Some(done.open_time);
        self.release(done)
    }

    fn release(&self, bar: Bar) -> Option<Bar> {
        if self.drop_doji && bar.is_price_doji() {
            debug!(series = %self.series, open_time = %bar.open_time, "doji bar dropped");
            return None;
        }
        Some(bar)
    }
}

// ---------------------------------------------------------------------------
// Terminal candles
// ---------------------------------------------------------------------------

/// Releases terminal-pushed candles once closed. The terminal re-sends the
/// forming candle on every change; only the final version is emitted.
#[derive(Debug, Clone)]
pub struct CandleGate {
    series: SeriesKey,
    drop_doji: bool,
    open: bool,
    floor: Option<NaiveDateTime>,
    pending: Option<Bar>,
}

impl CandleGate {
    pub fn new(series: SeriesKey, drop_doji: bool) -> Self {
        Self {
            series,
            drop_doji,
            open: false,
            floor: None,
            pending: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn start(&mut self, watermark: Option<NaiveDateTime>) {
        self.open = true;
        self.floor = watermark;
        self.pending = None;
    }

    pub fn suspend(&mut self) {
        self.open = false;
        self.pending = None;
    }

    /// Take one pushed candle. Returns closed candles in order.
    pub fn on_candle(&mut self, bar: Bar, terminal_now: NaiveDateTime) -> Vec<Bar> {
        if !self.open || self.floor.is_some_and(|f| bar.open_time <= f) {
            return Vec::new();
        }
        let mut out = Vec::new();
        match self.pending.take() {
            Some(prev) if prev.open_time < bar.open_time => {
                out.extend(self.close(prev));
                self.pending = Some(bar);
            }
            Some(prev) if prev.open_time > bar.open_time => {
                // Stale re-send of an older candle.
                self.pending = Some(prev);
            }
            _ => self.pending = Some(bar),
        }
        out.extend(self.poll(terminal_now));
        out
    }

    /// Release the pending candle if the terminal clock says it has closed.
    pub fn poll(&mut self, terminal_now: NaiveDateTime) -> Option<Bar> {
        let ready = self
            .pending
            .as_ref()
            .is_some_and(|b| is_complete(b, self.series.timeframe, terminal_now));
        if !ready {
            return None;
        }
        let bar = self.pending.take()?;
        self.close(bar)
    }

    fn close(&mut self, bar: Bar) -> Option<Bar> {
        self.floor = Some(bar.open_time);
        if self.drop_doji && bar.is_price_doji() {
            debug!(series = %self.series, open_time = %bar.open_time, "doji candle dropped");
            return None;
        }
        Some(bar)
    }
}
