//! `QuikAdapter`: one bridge session with its feeds, reconciler and
//! snapshots.
//!
//! Tasks spawned per adapter:
//! - reconciler: single writer of orders, fills, positions and cash
//! - market data: single writer of every feed and its watermark
//! - connection watcher: clock sync, account routing, cash and order resync
//!   after each (re)connect
//! - linked orders: OCO cancels and bracket children the reconciler asks for
//! - snapshot and account refresh loops
//!
//! Reads go through `watch` copies and never touch the network.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use qsync_config::{config_hash, AdapterConfig};
use qsync_md::{apply_filters, BarFilter, HistoryRequest};
use qsync_protocol::ProtocolCounters;
use qsync_reconcile::{AccountRouting, Order, OrderRequest, Position, ReconcilerView};
use qsync_schemas::{Bar, Instrument, InstrumentId, SeriesKey};
use qsync_session::{ConnectionGap, SessionConfig, SessionManager, SessionState, SessionStatus};

use crate::clock::TerminalClock;
use crate::feed::{self, Feed, FeedOptions, MarketControl, MarketInputs};
use crate::instruments::InstrumentCache;
use crate::source::{fetch_with_retry, SessionCandleSource};
use crate::trading::{self, TradingHandle};
use crate::{account, broker, links, persist};

/// Capacity of the order update broadcast.
const ORDER_UPDATES: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    pub(crate) cfg: AdapterConfig,
    pub(crate) config_hash: String,
    pub(crate) session: SessionManager,
    pub(crate) instruments: InstrumentCache,
    pub(crate) clock: TerminalClock,
    pub(crate) trading: TradingHandle,
    routing: Mutex<Option<AccountRouting>>,
    view: watch::Receiver<ReconcilerView>,
}

impl Shared {
    pub(crate) fn routing(&self) -> Option<AccountRouting> {
        lock(&self.routing).clone()
    }

    pub(crate) fn set_routing(&self, routing: AccountRouting) {
        *lock(&self.routing) = Some(routing);
    }

    pub(crate) fn order(&self, order_ref: u64) -> Option<Order> {
        self.view
            .borrow()
            .orders
            .iter()
            .find(|o| o.order_ref == order_ref)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct QuikAdapter {
    shared: Arc<Shared>,
    updates: broadcast::Sender<Order>,
    market: mpsc::Sender<MarketControl>,
    ready: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QuikAdapter {
    /// Validate `cfg`, restore the snapshot and start connecting. Must be
    /// called inside a Tokio runtime; returns before the session is up.
    pub fn start(cfg: AdapterConfig) -> Result<Self> {
        cfg.validate().context("invalid adapter config")?;
        let config_hash = config_hash(&cfg)?;
        info!(
            host = %cfg.host,
            port = cfg.port,
            event_port = cfg.event_port(),
            data_dir = %cfg.data_dir.display(),
            config_hash = %config_hash,
            "adapter starting"
        );

        let rec = persist::load_reconciler(&cfg, &config_hash);
        let (view_tx, view_rx) = watch::channel(rec.view());
        let (updates, _) = broadcast::channel(ORDER_UPDATES);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (market_tx, market_rx) = mpsc::channel(64);
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);

        let (session, events) = SessionManager::start(SessionConfig::from_adapter(&cfg));
        let status = session.subscribe_status();
        let snapshot_secs = cfg.snapshot_interval_secs;
        let refresh_secs = cfg.account_refresh_secs;

        let shared = Arc::new(Shared {
            cfg,
            config_hash,
            session,
            instruments: InstrumentCache::new(),
            clock: TerminalClock::new(),
            trading: TradingHandle::new(cmd_tx),
            routing: Mutex::new(None),
            view: view_rx,
        });

        let mut tasks = vec![
            tokio::spawn(trading::run(
                rec,
                cmd_rx,
                events.trading,
                view_tx,
                updates.clone(),
                links_tx,
            )),
            tokio::spawn(links::run(shared.clone(), links_rx)),
            tokio::spawn(feed::run(
                shared.clone(),
                MarketInputs {
                    market: events.market,
                    control: market_rx,
                    status,
                },
            )),
            tokio::spawn(watch_connection(shared.clone(), ready_tx)),
        ];
        if snapshot_secs > 0 {
            tasks.push(tokio::spawn(snapshot_loop(
                shared.clone(),
                market_tx.clone(),
                Duration::from_secs(snapshot_secs),
            )));
        }
        if refresh_secs > 0 {
            tasks.push(tokio::spawn(account_refresh_loop(
                shared.clone(),
                Duration::from_secs(refresh_secs),
            )));
        }

        Ok(Self {
            shared,
            updates,
            market: market_tx,
            ready: ready_rx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.shared.cfg
    }

    pub fn config_hash(&self) -> &str {
        &self.shared.config_hash
    }

    // --- session ------------------------------------------------------------

    pub fn session_status(&self) -> SessionStatus {
        self.shared.session.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.session.subscribe_status()
    }

    /// Wait for the first connect and its account sync.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|r| *r)
            .await
            .map(|_| ())
            .context("adapter stopped before it was ready")
    }

    /// Wait for the bridge connection only; account sync may still be running.
    pub async fn wait_connected(&self) -> Result<u64> {
        Ok(self.shared.session.wait_connected().await?)
    }

    /// Restart a session that exhausted its reconnect budget.
    pub fn reconnect(&self) {
        self.shared.session.reconnect();
    }

    pub fn protocol_counters(&self) -> ProtocolCounters {
        self.shared.session.protocol_counters()
    }

    pub fn connection_gaps(&self) -> Vec<ConnectionGap> {
        self.shared.session.connection_gaps()
    }

    // --- reference data -----------------------------------------------------

    /// `CLASS.SEC` or a bare ticker.
    pub async fn resolve(&self, ticker: &str) -> Result<InstrumentId> {
        self.shared
            .instruments
            .resolve_ticker(&self.shared.session, ticker)
            .await
    }

    pub async fn instrument(&self, id: &InstrumentId) -> Result<Instrument> {
        self.shared.instruments.instrument(&self.shared.session, id).await
    }

    // --- market data --------------------------------------------------------

    /// Backfill `series` and, with `opts.live_bars`, keep it live.
    pub async fn subscribe(&self, series: SeriesKey, opts: FeedOptions) -> Result<Feed> {
        let (tx, rx) = mpsc::channel(self.shared.cfg.feed_queue_capacity);
        self.market
            .send(MarketControl::Subscribe {
                series: series.clone(),
                opts,
                tx,
            })
            .await
            .context("market task stopped")?;
        Ok(Feed::new(series, rx))
    }

    /// Stop delivery. A running backfill is not aborted; its bars are dropped.
    pub async fn unsubscribe(&self, series: &SeriesKey) -> Result<()> {
        self.market
            .send(MarketControl::Unsubscribe(series.clone()))
            .await
            .context("market task stopped")
    }

    /// One-shot history: the latest `count` complete bars after the configured
    /// filters. Survives a session drop within the reconnect budget.
    pub async fn history(&self, series: &SeriesKey, count: usize) -> Result<Vec<Bar>> {
        let cfg = &self.shared.cfg;
        let req = HistoryRequest {
            series: series.clone(),
            count: count.max(1),
            since: cfg.fromdate,
            page_size: cfg.history_page_size,
            max_pages: cfg.history_max_pages,
        };
        let session = &self.shared.session;
        // Completeness is judged on terminal time; a caller that did not
        // wait for readiness may get here before the connect hook ran.
        if self.shared.clock.offset().is_none() {
            self.shared.clock.sync(session).await;
        }
        let source = SessionCandleSource::new(session.clone());
        let bars = fetch_with_retry(session, &source, &req, cfg.max_reconnect_attempts.max(1))
            .await
            .with_context(|| format!("history for {series}"))?;
        let filter = BarFilter {
            from: cfg.fromdate,
            to: cfg.todate,
            drop_doji: cfg.drop_price_doji,
        };
        Ok(apply_filters(bars, series.timeframe, &filter, self.shared.clock.now(), None))
    }

    // --- trading ------------------------------------------------------------

    /// Send a new order. The returned copy is `Submitted`, or `Rejected` when
    /// it failed locally; later changes arrive on [`Self::order_updates`].
    pub async fn submit(&self, req: OrderRequest) -> Result<Order> {
        broker::submit(&self.shared, req).await
    }

    pub async fn cancel(&self, order_ref: u64) -> Result<Order> {
        broker::cancel(&self.shared, order_ref).await
    }

    pub fn order_updates(&self) -> broadcast::Receiver<Order> {
        self.updates.subscribe()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ReconcilerView> {
        self.shared.view.clone()
    }

    pub fn view(&self) -> ReconcilerView {
        self.shared.view.borrow().clone()
    }

    pub fn order(&self, order_ref: u64) -> Option<Order> {
        self.shared.order(order_ref)
    }

    pub fn orders(&self) -> Vec<Order> {
        self.shared.view.borrow().orders.clone()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.shared.view.borrow().positions.clone()
    }

    pub fn position(&self, id: &InstrumentId) -> Option<Position> {
        self.shared
            .view
            .borrow()
            .positions
            .iter()
            .find(|p| &p.instrument == id)
            .cloned()
    }

    pub fn cash(&self) -> i64 {
        self.shared.view.borrow().cash
    }

    pub fn equity(&self) -> i64 {
        self.shared.view.borrow().equity
    }

    pub fn routing(&self) -> Option<AccountRouting> {
        self.shared.routing()
    }

    /// Re-resolve the account and replace cash with the terminal balance.
    pub async fn refresh_account(&self) -> Result<i64> {
        account::sync_account(&self.shared).await?;
        account::refresh_cash(&self.shared).await
    }

    // --- lifecycle ----------------------------------------------------------

    /// Write bar caches and `state.json` now.
    pub async fn snapshot(&self) -> Result<()> {
        write_snapshot(&self.shared, &self.market).await
    }

    /// Final snapshot, then stop the session and every task.
    pub async fn shutdown(&self) -> Result<()> {
        let res = self.snapshot().await;
        self.shared.session.shutdown();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        info!("adapter stopped");
        res
    }
}

impl Drop for QuikAdapter {
    fn drop(&mut self) {
        self.shared.session.shutdown();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn write_snapshot(shared: &Shared, market: &mpsc::Sender<MarketControl>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let series = match market.send(MarketControl::Snapshot(tx)).await {
        Ok(()) => rx.await.unwrap_or(0),
        Err(_) => 0,
    };
    let state = shared.trading.snapshot().await?;
    persist::save_reconciler(&shared.cfg, &shared.config_hash, &state)?;
    debug!(series, orders = state.orders.len(), "snapshot written");
    Ok(())
}

async fn snapshot_loop(shared: Arc<Shared>, market: mpsc::Sender<MarketControl>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tick.tick().await;
        if let Err(e) = write_snapshot(&shared, &market).await {
            warn!(error = %format!("{e:#}"), "periodic snapshot failed");
        }
    }
}

async fn account_refresh_loop(shared: Arc<Shared>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tick.tick().await;
        if !shared.session.is_connected() || shared.routing().is_none() {
            continue;
        }
        match account::refresh_cash(&shared).await {
            Ok(cash) => debug!(cash, "cash refreshed"),
            Err(e) => warn!(error = %format!("{e:#}"), "cash refresh failed"),
        }
    }
}

/// After each new session generation: terminal clock, account, cash and
/// order resync. Startup positions are read until they load once.
async fn watch_connection(shared: Arc<Shared>, ready: watch::Sender<bool>) {
    let mut status = shared.session.subscribe_status();
    let mut seen = 0u64;
    let mut baseline_loaded = false;
    loop {
        let connected = {
            let s = status.borrow_and_update();
            (s.state == SessionState::Connected).then_some(s.generation)
        };
        if let Some(generation) = connected.filter(|g| *g != seen) {
            seen = generation;
            baseline_loaded |= on_connected(&shared, !baseline_loaded).await;
            ready.send_replace(true);
        }
        if status.changed().await.is_err() {
            break;
        }
    }
}

/// Returns whether startup positions were applied on this connect.
async fn on_connected(shared: &Shared, want_baseline: bool) -> bool {
    shared.clock.sync(&shared.session).await;
    let routing = match account::sync_account(shared).await {
        Ok(routing) => routing,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "account sync failed, orders refused until it succeeds");
            return false;
        }
    };
    if let Err(e) = account::refresh_cash(shared).await {
        warn!(error = %format!("{e:#}"), "cash query failed");
    }
    let mut baseline = false;
    if want_baseline {
        match account::baseline_positions(shared, &routing).await {
            Ok(positions) => {
                shared.trading.set_baseline(positions).await;
                baseline = true;
            }
            Err(e) => warn!(error = %format!("{e:#}"), "startup positions unavailable, retried on next connect"),
        }
    }
    if let Err(e) = account::resync(shared).await {
        warn!(error = %format!("{e:#}"), "order resync failed");
    }
    baseline
}
