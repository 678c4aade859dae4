//! Historical bar loader.
//!
//! The terminal serves candles in pages: up to `count` bars strictly before
//! `to` (the latest bars when `to` is absent), oldest first. The loader walks
//! pages backward and assembles one ascending sequence keyed by open time.
//! On overlap the first-seen bar wins, so cached bars merged ahead of fetched
//! pages are never overwritten.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use tracing::{debug, warn};

use qsync_schemas::{Bar, SeriesKey, Timeframe};

/// Bars whose close time is within this of terminal now count as complete.
pub const COMPLETION_SLACK_SECS: i64 = 3;

/// Extra bars requested on top of the elapsed-time estimate.
const DEPTH_MARGIN: usize = 10;

// ---------------------------------------------------------------------------
// Source boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// The session dropped or the request timed out; worth reissuing.
    Transport(String),
    /// The terminal answered with an error.
    Remote(String),
    /// The page could not be decoded.
    Decode(String),
}

impl HistoryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HistoryError::Transport(_))
    }
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::Transport(msg) => write!(f, "history transport error: {msg}"),
            HistoryError::Remote(msg) => write!(f, "history request failed: {msg}"),
            HistoryError::Decode(msg) => write!(f, "history decode error: {msg}"),
        }
    }
}

impl std::error::Error for HistoryError {}

/// One page of candles: up to `count` bars with open time strictly before
/// `to` (latest when `None`), ascending.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_page(
        &self,
        series: &SeriesKey,
        count: usize,
        to: Option<NaiveDateTime>,
    ) -> Result<Vec<Bar>, HistoryError>;
}

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub series: SeriesKey,
    /// Bars wanted.
    pub count: usize,
    /// Keep paging until a bar at or before this time is reached (gap fill).
    pub since: Option<NaiveDateTime>,
    pub page_size: usize,
    pub max_pages: usize,
}

/// Fetch pages backward until `count` bars (and `since`, when set) are
/// covered, a page is empty or short, a page adds nothing new, or
/// `max_pages` is hit. Returns ascending, deduplicated bars.
pub async fn fetch_history(
    source: &dyn CandleSource,
    req: &HistoryRequest,
) -> Result<Vec<Bar>, HistoryError> {
    let mut by_time: BTreeMap<NaiveDateTime, Bar> = BTreeMap::new();
    let mut to: Option<NaiveDateTime> = None;
    let page_size = req.page_size.max(1);

    for page_no in 0..req.max_pages.max(1) {
        let want = if req.since.is_some() {
            page_size
        } else {
            req.count.saturating_sub(by_time.len()).clamp(1, page_size)
        };
        let page = source.fetch_page(&req.series, want, to).await?;
        let fetched = page.len();

        let mut added = 0usize;
        let mut oldest: Option<NaiveDateTime> = None;
        for bar in page {
            if !bar.is_consistent() {
                warn!(series = %req.series, open_time = %bar.open_time, "inconsistent bar dropped");
                continue;
            }
            oldest = Some(oldest.map_or(bar.open_time, |o: NaiveDateTime| o.min(bar.open_time)));
            if let std::collections::btree_map::Entry::Vacant(slot) = by_time.entry(bar.open_time) {
                slot.insert(bar);
                added += 1;
            }
        }
        debug!(series = %req.series, page = page_no, fetched, added, "history page");

        let Some(oldest) = oldest else { break };
        if added == 0 || fetched < want {
            break;
        }
        let covered = match req.since {
            Some(since) => oldest <= since,
            None => by_time.len() >= req.count,
        };
        if covered {
            break;
        }
        to = Some(oldest);
    }

    Ok(by_time.into_values().collect())
}

/// `max(count, minutes since the last cached bar / interval + margin)`.
pub fn history_depth(
    count: usize,
    last_cached: Option<NaiveDateTime>,
    now: NaiveDateTime,
    tf: Timeframe,
) -> usize {
    let Some(last) = last_cached else {
        return count;
    };
    let minutes = (now - last).num_minutes().max(0);
    let bars = (minutes / tf.nominal_minutes().max(1)) as usize + DEPTH_MARGIN;
    count.max(bars)
}

/// Cached bars first, then fetched ones; first-seen wins per open time.
pub fn merge_first_seen(cached: Vec<Bar>, fetched: Vec<Bar>) -> Vec<Bar> {
    let mut by_time: BTreeMap<NaiveDateTime, Bar> = BTreeMap::new();
    for bar in cached.into_iter().chain(fetched) {
        by_time.entry(bar.open_time).or_insert(bar);
    }
    by_time.into_values().collect()
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Filters applied to assembled history before delivery, in order: date
/// window, doji, completion gate, watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarFilter {
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
    pub drop_doji: bool,
}

/// Closed by `terminal_now` (with slack).
pub fn is_complete(bar: &Bar, tf: Timeframe, terminal_now: NaiveDateTime) -> bool {
    tf.next_open(bar.open_time) <= terminal_now + Duration::seconds(COMPLETION_SLACK_SECS)
}

pub fn apply_filters(
    bars: Vec<Bar>,
    tf: Timeframe,
    filter: &BarFilter,
    terminal_now: NaiveDateTime,
    watermark: Option<NaiveDateTime>,
) -> Vec<Bar> {
    bars.into_iter()
        .filter(|b| filter.from.map_or(true, |f| b.open_time >= f))
        .filter(|b| filter.to.map_or(true, |t| b.open_time <= t))
        .filter(|b| {
            if filter.drop_doji && b.is_price_doji() {
                debug!(open_time = %b.open_time, "doji bar dropped");
                return false;
            }
            true
        })
        .filter(|b| is_complete(b, tf, terminal_now))
        .filter(|b| watermark.map_or(true, |w| b.open_time > w))
        .collect()
}
