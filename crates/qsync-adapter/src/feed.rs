//! Bar feeds.
//!
//! One market-data task owns every subscription: it runs backfills, folds
//! market events into live bars and is the only writer of each feed's
//! watermark. Consumers hold a [`Feed`], the receiving end of a bounded
//! queue of bars and status changes.
//!
//! A bar is handed to the consumer with `try_send`; the watermark moves only
//! when the send succeeded. A full queue never blocks the task: the feed is
//! suspended and refetched from its watermark once there is room.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use qsync_config::{AdapterConfig, LiveSource};
use qsync_md::{
    apply_filters, history_depth, is_complete, merge_first_seen, BarAggregator, BarFilter,
    CandleGate, FeedItem, FeedStatus, HistoryError, HistoryRequest, Subscription,
};
use qsync_protocol::{BridgeEvent, Command};
use qsync_schemas::{Bar, InstrumentId, SeriesKey};
use qsync_session::{SessionState, SessionStatus};
use qsync_store::BarCache;

use crate::adapter::Shared;
use crate::source::{fetch_with_retry, SessionCandleSource};

/// Housekeeping period: overflow checks, candle completion, refetches and
/// last-price publication.
const HOUSEKEEPING: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Public feed types
// ---------------------------------------------------------------------------

/// Per-subscription options. Defaults come from the adapter config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOptions {
    /// Keep streaming after history. `false` ends the feed with
    /// `Disconnected` once history is delivered.
    pub live_bars: bool,
    pub live_source: LiveSource,
    pub count: usize,
    pub fromdate: Option<NaiveDateTime>,
    pub todate: Option<NaiveDateTime>,
    pub drop_doji: bool,
}

impl FeedOptions {
    pub fn from_config(cfg: &AdapterConfig) -> Self {
        Self {
            live_bars: cfg.live_bars,
            live_source: cfg.live_source,
            count: cfg.count,
            fromdate: cfg.fromdate,
            todate: cfg.todate,
            drop_doji: cfg.drop_price_doji,
        }
    }

    fn filter(&self) -> BarFilter {
        BarFilter {
            from: self.fromdate,
            to: self.todate,
            drop_doji: self.drop_doji,
        }
    }
}

/// Consumer end of one subscription.
#[derive(Debug)]
pub struct Feed {
    series: SeriesKey,
    rx: mpsc::Receiver<FeedItem>,
}

impl Feed {
    pub(crate) fn new(series: SeriesKey, rx: mpsc::Receiver<FeedItem>) -> Self {
        Self { series, rx }
    }

    pub fn series(&self) -> &SeriesKey {
        &self.series
    }

    /// Next bar or status. `None` once the feed is gone.
    pub async fn next(&mut self) -> Option<FeedItem> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<FeedItem> {
        ReceiverStream::new(self.rx)
    }
}

pub(crate) enum MarketControl {
    Subscribe {
        series: SeriesKey,
        opts: FeedOptions,
        tx: mpsc::Sender<FeedItem>,
    },
    Unsubscribe(SeriesKey),
    /// Write every feed's bar cache. Replies with the number written.
    Snapshot(oneshot::Sender<usize>),
}

// ---------------------------------------------------------------------------
// Per-feed state
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum LiveBuilder {
    Ticks(BarAggregator),
    Candles(CandleGate),
}

impl LiveBuilder {
    fn start(&mut self, floor: Option<NaiveDateTime>, seed: Option<Bar>) {
        match self {
            LiveBuilder::Ticks(agg) => agg.start(floor, seed),
            LiveBuilder::Candles(gate) => gate.start(floor),
        }
    }

    fn suspend(&mut self) {
        match self {
            LiveBuilder::Ticks(agg) => agg.suspend(),
            LiveBuilder::Candles(gate) => gate.suspend(),
        }
    }
}

enum Sent {
    Delivered,
    Skipped,
    Full,
    Closed,
}

struct Feeder {
    sub: Subscription,
    opts: FeedOptions,
    tx: mpsc::Sender<FeedItem>,
    live: LiveBuilder,
    /// Complete bars kept for the on-disk cache, ascending.
    bars: Vec<Bar>,
    /// Epoch of the running backfill.
    in_flight: Option<u64>,
}

impl Feeder {
    fn push_status(&mut self, status: FeedStatus) {
        if !self.sub.set_status(status) {
            return;
        }
        debug!(series = %self.sub.series, ?status, "feed status");
        if let Err(TrySendError::Full(_)) = self.tx.try_send(FeedItem::Status(status)) {
            warn!(series = %self.sub.series, ?status, "consumer queue full, status dropped");
        }
    }

    fn send_bar(&mut self, bar: Bar) -> Sent {
        if !self.sub.watermark.admits(bar.open_time) {
            return Sent::Skipped;
        }
        let open_time = bar.open_time;
        match self.tx.try_send(FeedItem::Bar(bar)) {
            Ok(()) => {
                self.sub.watermark.advance(open_time);
                Sent::Delivered
            }
            Err(TrySendError::Full(_)) => Sent::Full,
            Err(TrySendError::Closed(_)) => Sent::Closed,
        }
    }

    /// Stop live bars until the gap since the watermark is refetched.
    fn suspend(&mut self) {
        self.sub.backfilled = false;
        self.sub.needs_refetch = true;
        self.live.suspend();
    }

    fn keep(&mut self, bar: Bar, depth: usize) {
        if self.bars.last().map_or(true, |b| b.open_time < bar.open_time) {
            self.bars.push(bar);
            keep_last(&mut self.bars, depth);
        }
    }

    /// One live bar. Returns `false` when the consumer is gone.
    fn deliver_live(&mut self, bar: Bar, depth: usize) -> bool {
        self.keep(bar.clone(), depth);
        if self.sub.status != FeedStatus::Live {
            self.push_status(FeedStatus::Live);
        }
        match self.send_bar(bar) {
            Sent::Delivered | Sent::Skipped => true,
            Sent::Full => {
                warn!(series = %self.sub.series, "consumer queue full, refetch scheduled");
                self.suspend();
                true
            }
            Sent::Closed => false,
        }
    }
}

fn keep_last(bars: &mut Vec<Bar>, depth: usize) {
    if bars.len() > depth {
        let excess = bars.len() - depth;
        bars.drain(..excess);
    }
}

struct BackfillDone {
    series: SeriesKey,
    epoch: u64,
    result: Result<Vec<Bar>, HistoryError>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub(crate) struct MarketTask {
    shared: Arc<Shared>,
    cache: BarCache,
    feeds: BTreeMap<SeriesKey, Feeder>,
    done_tx: mpsc::Sender<BackfillDone>,
    generation: u64,
    connected: bool,
    next_epoch: u64,
    /// Latest trade prices not yet handed to the reconciler.
    prices: BTreeMap<InstrumentId, i64>,
}

pub(crate) struct MarketInputs {
    pub(crate) market: mpsc::Receiver<BridgeEvent>,
    pub(crate) control: mpsc::Receiver<MarketControl>,
    pub(crate) status: watch::Receiver<SessionStatus>,
}

pub(crate) async fn run(shared: Arc<Shared>, inputs: MarketInputs) {
    let MarketInputs {
        mut market,
        mut control,
        mut status,
    } = inputs;
    let (done_tx, mut done_rx) = mpsc::channel(64);
    let cache = BarCache::new(shared.cfg.data_dir.clone(), shared.cfg.cache_depth);
    let mut task = MarketTask {
        shared,
        cache,
        feeds: BTreeMap::new(),
        done_tx,
        generation: 0,
        connected: false,
        next_epoch: 0,
        prices: BTreeMap::new(),
    };

    let mut housekeeping = tokio::time::interval(HOUSEKEEPING);
    let mut market_open = true;
    let mut status_open = true;
    let initial = status.borrow_and_update().clone();
    task.on_status(&initial);

    loop {
        tokio::select! {
            ctl = control.recv() => match ctl {
                Some(ctl) => task.on_control(ctl),
                None => break,
            },
            Some(done) = done_rx.recv() => task.on_backfill(done),
            ev = market.recv(), if market_open => match ev {
                Some(ev) => task.on_market(ev),
                None => market_open = false,
            },
            changed = status.changed(), if status_open => match changed {
                Ok(()) => {
                    let s = status.borrow_and_update().clone();
                    task.on_status(&s);
                }
                Err(_) => status_open = false,
            },
            _ = housekeeping.tick() => task.on_housekeeping(),
        }
    }
    debug!("market task finished");
}

impl MarketTask {
    fn on_control(&mut self, ctl: MarketControl) {
        match ctl {
            MarketControl::Subscribe { series, opts, tx } => self.subscribe(series, opts, tx),
            MarketControl::Unsubscribe(series) => self.unsubscribe(&series),
            MarketControl::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn subscribe(&mut self, series: SeriesKey, opts: FeedOptions, tx: mpsc::Sender<FeedItem>) {
        if self.feeds.contains_key(&series) {
            info!(series = %series, "series re-subscribed, previous feed closed");
            self.unsubscribe(&series);
        }
        let bars = self.cache.load(&series).unwrap_or_default();
        let live = match opts.live_source {
            LiveSource::Ticks => LiveBuilder::Ticks(BarAggregator::new(series.clone(), opts.drop_doji)),
            LiveSource::Candles => LiveBuilder::Candles(CandleGate::new(series.clone(), opts.drop_doji)),
        };
        if tx.try_send(FeedItem::Status(FeedStatus::Delayed)).is_err() {
            warn!(series = %series, "consumer queue unavailable at subscribe");
        }
        info!(
            series = %series,
            cached = bars.len(),
            live = opts.live_bars,
            source = ?opts.live_source,
            "series subscribed"
        );
        if self.connected && opts.live_bars && opts.live_source == LiveSource::Candles {
            self.candle_call(Command::subscribe_candles(&series));
        }
        self.feeds.insert(
            series.clone(),
            Feeder {
                sub: Subscription::new(series.clone(), None),
                opts,
                tx,
                live,
                bars,
                in_flight: None,
            },
        );
        self.launch_backfill(&series);
    }

    fn unsubscribe(&mut self, series: &SeriesKey) {
        let Some(mut f) = self.feeds.remove(series) else {
            return;
        };
        // An in-flight backfill is left to finish; its result is dropped.
        f.push_status(FeedStatus::Disconnected);
        if f.opts.live_bars && f.opts.live_source == LiveSource::Candles && self.connected {
            self.candle_call(Command::unsubscribe_candles(series));
        }
        info!(series = %series, "series unsubscribed");
    }

    fn candle_call(&self, cmd: Command) {
        let session = self.shared.session.clone();
        tokio::spawn(async move {
            let name = cmd.name;
            if let Err(e) = session.call(cmd).await {
                warn!(command = name, error = %e, "candle subscription call failed");
            }
        });
    }

    fn snapshot(&self) -> usize {
        let mut written = 0;
        for (series, f) in &self.feeds {
            match self.cache.save(series, &f.bars) {
                Ok(()) => written += 1,
                Err(e) => warn!(series = %series, error = %e, "bar cache write failed"),
            }
        }
        written
    }

    // --- backfill -----------------------------------------------------------

    fn launch_backfill(&mut self, series: &SeriesKey) {
        let Some(f) = self.feeds.get_mut(series) else {
            return;
        };
        if f.in_flight.is_some() {
            return;
        }
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        f.in_flight = Some(epoch);

        let cfg = &self.shared.cfg;
        let last_cached = f.bars.last().map(|b| b.open_time);
        let req = HistoryRequest {
            series: series.clone(),
            count: history_depth(f.opts.count, last_cached, self.shared.clock.now(), series.timeframe),
            since: f.sub.watermark.get().or(f.opts.fromdate),
            page_size: cfg.history_page_size,
            max_pages: cfg.history_max_pages,
        };
        debug!(series = %series, epoch, count = req.count, since = ?req.since, "backfill started");

        let session = self.shared.session.clone();
        let done = self.done_tx.clone();
        let attempts = cfg.max_reconnect_attempts.max(1);
        tokio::spawn(async move {
            let source = SessionCandleSource::new(session.clone());
            let result = fetch_with_retry(&session, &source, &req, attempts).await;
            let _ = done
                .send(BackfillDone {
                    series: req.series,
                    epoch,
                    result,
                })
                .await;
        });
    }

    fn on_backfill(&mut self, done: BackfillDone) {
        let series = done.series;
        let depth = self.shared.cfg.cache_depth;
        let now = self.shared.clock.now();
        let Some(f) = self.feeds.get_mut(&series) else {
            debug!(series = %series, "backfill for a removed feed dropped");
            return;
        };
        if f.in_flight != Some(done.epoch) {
            return;
        }
        f.in_flight = None;

        let fetched = match done.result {
            Ok(bars) => bars,
            Err(e) => {
                warn!(series = %series, error = %e, "backfill failed, feed closed");
                f.push_status(FeedStatus::Disconnected);
                self.feeds.remove(&series);
                return;
            }
        };

        let tf = series.timeframe;
        let fetched_len = fetched.len();
        let seed = fetched.last().filter(|b| !is_complete(b, tf, now)).cloned();
        let merged = merge_first_seen(std::mem::take(&mut f.bars), fetched);
        let deliver = apply_filters(merged.clone(), tf, &f.opts.filter(), now, f.sub.watermark.get());
        f.bars = merged.into_iter().filter(|b| is_complete(b, tf, now)).collect();
        keep_last(&mut f.bars, depth);

        let mut delivered = 0usize;
        for bar in deliver {
            match f.send_bar(bar) {
                Sent::Delivered => delivered += 1,
                Sent::Skipped => {}
                Sent::Full => {
                    warn!(series = %series, delivered, "consumer queue full during backfill, refetch scheduled");
                    f.suspend();
                    return;
                }
                Sent::Closed => {
                    debug!(series = %series, "consumer dropped its feed");
                    self.feeds.remove(&series);
                    return;
                }
            }
        }
        info!(series = %series, fetched = fetched_len, delivered, watermark = ?f.sub.watermark.get(), "backfill delivered");

        if !f.opts.live_bars {
            f.push_status(FeedStatus::Disconnected);
            self.feeds.remove(&series);
            return;
        }
        f.sub.backfilled = true;
        f.sub.needs_refetch = false;
        f.push_status(FeedStatus::Connected);
        let floor = f.bars.last().map(|b| b.open_time).max(f.sub.watermark.get());
        f.live.start(floor, seed);
    }

    fn launch_refetches(&mut self) {
        if !self.connected {
            return;
        }
        let due: Vec<SeriesKey> = self
            .feeds
            .iter_mut()
            .filter(|(_, f)| f.sub.needs_refetch && f.in_flight.is_none())
            .map(|(s, f)| {
                f.push_status(FeedStatus::Delayed);
                s.clone()
            })
            .collect();
        for series in due {
            info!(series = %series, since = ?self.feeds.get(&series).and_then(|f| f.sub.watermark.get()), "refetching gap");
            self.launch_backfill(&series);
        }
    }

    // --- live ---------------------------------------------------------------

    fn on_market(&mut self, ev: BridgeEvent) {
        let depth = self.shared.cfg.cache_depth;
        let mut gone = Vec::new();
        match ev {
            BridgeEvent::Tick(tick) => {
                self.prices.insert(tick.instrument.clone(), tick.price);
                for (series, f) in self.feeds.iter_mut() {
                    if series.instrument != tick.instrument {
                        continue;
                    }
                    let LiveBuilder::Ticks(agg) = &mut f.live else {
                        continue;
                    };
                    if let Some(bar) = agg.on_tick(&tick) {
                        if !f.deliver_live(bar, depth) {
                            gone.push(series.clone());
                        }
                    }
                }
            }
            BridgeEvent::Candle { series, bar } => {
                self.prices.insert(series.instrument.clone(), bar.close);
                let now = self.shared.clock.now();
                if let Some(f) = self.feeds.get_mut(&series) {
                    if let LiveBuilder::Candles(gate) = &mut f.live {
                        for bar in gate.on_candle(bar, now) {
                            if !f.deliver_live(bar, depth) {
                                gone.push(series.clone());
                                break;
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        for series in gone {
            debug!(series = %series, "consumer dropped its feed");
            self.feeds.remove(&series);
        }
    }

    fn on_status(&mut self, status: &SessionStatus) {
        if status.state != SessionState::Connected {
            if self.connected {
                self.connected = false;
                for f in self.feeds.values_mut().filter(|f| f.sub.backfilled) {
                    f.suspend();
                }
            }
            if status.fatal {
                for f in self.feeds.values_mut() {
                    f.push_status(FeedStatus::Disconnected);
                }
            }
            return;
        }
        self.connected = true;
        if status.generation == self.generation {
            return;
        }
        self.generation = status.generation;
        // A reconnect the watch coalesced away still leaves a gap.
        for f in self.feeds.values_mut().filter(|f| f.sub.backfilled) {
            f.suspend();
        }
        let candle_feeds: Vec<SeriesKey> = self
            .feeds
            .iter()
            .filter(|(_, f)| f.opts.live_bars && f.opts.live_source == LiveSource::Candles)
            .map(|(s, _)| s.clone())
            .collect();
        for series in &candle_feeds {
            self.candle_call(Command::subscribe_candles(series));
        }
        self.launch_refetches();
    }

    fn on_housekeeping(&mut self) {
        let overflowed: BTreeSet<InstrumentId> = self.shared.session.take_overflowed();
        if !overflowed.is_empty() {
            for f in self
                .feeds
                .values_mut()
                .filter(|f| f.sub.backfilled && overflowed.contains(&f.sub.series.instrument))
            {
                warn!(series = %f.sub.series, "market events dropped, refetch scheduled");
                f.suspend();
            }
        }

        if self.connected {
            let depth = self.shared.cfg.cache_depth;
            let now = self.shared.clock.now();
            let mut gone = Vec::new();
            for (series, f) in self.feeds.iter_mut() {
                let LiveBuilder::Candles(gate) = &mut f.live else {
                    continue;
                };
                if let Some(bar) = gate.poll(now) {
                    if !f.deliver_live(bar, depth) {
                        gone.push(series.clone());
                    }
                }
            }
            for series in gone {
                self.feeds.remove(&series);
            }
        }

        self.launch_refetches();

        for (id, price) in std::mem::take(&mut self.prices) {
            self.shared.trading.offer_last_price(id, price);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn options_follow_the_config() {
        let cfg = AdapterConfig {
            live_bars: true,
            live_source: LiveSource::Candles,
            count: 50,
            drop_price_doji: true,
            ..AdapterConfig::default()
        };
        let opts = FeedOptions::from_config(&cfg);
        assert!(opts.live_bars && opts.drop_doji);
        assert_eq!(opts.count, 50);
        assert_eq!(opts.live_source, LiveSource::Candles);
        assert_eq!(opts.filter().from, None);
    }

    #[test]
    fn keep_last_trims_oldest() {
        let t0 = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let mut bars: Vec<Bar> = (0..5)
            .map(|m| Bar::opened(t0 + chrono::Duration::minutes(m), 1, 1))
            .collect();
        keep_last(&mut bars, 2);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open_time, t0 + chrono::Duration::minutes(3));
    }
}
