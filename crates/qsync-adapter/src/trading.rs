//! The reconciler task.
//!
//! One task owns the [`Reconciler`]. Trading events from the session and
//! mutations from the broker facade both arrive here; commands are taken
//! first so an order is `Submitted` before the terminal can answer it.
//! After every change the task publishes a fresh [`ReconcilerView`] and
//! forwards order notifications and linked-order follow-ups.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use qsync_protocol::events::{OrderRow, StopOrderRow};
use qsync_protocol::BridgeEvent;
use qsync_reconcile::{
    resync_orders, FollowUp, Order, OrderRequest, Position, ReconcileError, Reconciler, ReconcilerSnapshot,
    ReconcilerView, RestoreReport,
};
use qsync_schemas::{Instrument, InstrumentId};

pub(crate) enum TradingCmd {
    Create {
        req: OrderRequest,
        reply: oneshot::Sender<Order>,
    },
    Submitted {
        order_ref: u64,
        ack_pending: bool,
        reply: oneshot::Sender<Result<Order, ReconcileError>>,
    },
    Reject {
        order_ref: u64,
        reason: String,
        reply: oneshot::Sender<Result<Order, ReconcileError>>,
    },
    Cancel {
        order_ref: u64,
        reply: oneshot::Sender<Result<(Order, i64), ReconcileError>>,
    },
    CancelFailed(u64),
    Instrument(Instrument),
    LastPrice(InstrumentId, i64),
    Cash(i64),
    Baseline(Vec<Position>),
    Resync {
        orders: Vec<OrderRow>,
        stops: Vec<StopOrderRow>,
        requested_at: DateTime<Utc>,
        reply: oneshot::Sender<RestoreReport>,
    },
    Snapshot(oneshot::Sender<ReconcilerSnapshot>),
}

/// Cheap handle to the reconciler task.
#[derive(Clone)]
pub(crate) struct TradingHandle {
    tx: mpsc::Sender<TradingCmd>,
}

fn gone() -> anyhow::Error {
    anyhow!("reconciler task stopped")
}

impl TradingHandle {
    pub(crate) fn new(tx: mpsc::Sender<TradingCmd>) -> Self {
        Self { tx }
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> TradingCmd) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())
    }

    async fn tell(&self, cmd: TradingCmd) {
        if self.tx.send(cmd).await.is_err() {
            warn!("reconciler task stopped, update dropped");
        }
    }

    pub(crate) async fn create(&self, req: OrderRequest) -> Result<Order> {
        self.ask(|reply| TradingCmd::Create { req, reply }).await
    }

    pub(crate) async fn submitted(&self, order_ref: u64, ack_pending: bool) -> Result<Order> {
        Ok(self
            .ask(|reply| TradingCmd::Submitted {
                order_ref,
                ack_pending,
                reply,
            })
            .await??)
    }

    pub(crate) async fn reject(&self, order_ref: u64, reason: impl Into<String>) -> Result<Order> {
        let reason = reason.into();
        Ok(self
            .ask(|reply| TradingCmd::Reject {
                order_ref,
                reason,
                reply,
            })
            .await??)
    }

    pub(crate) async fn request_cancel(&self, order_ref: u64) -> Result<(Order, i64)> {
        Ok(self.ask(|reply| TradingCmd::Cancel { order_ref, reply }).await??)
    }

    pub(crate) async fn cancel_failed(&self, order_ref: u64) {
        self.tell(TradingCmd::CancelFailed(order_ref)).await
    }

    pub(crate) async fn register_instrument(&self, instrument: Instrument) {
        self.tell(TradingCmd::Instrument(instrument)).await
    }

    pub(crate) async fn set_last_price(&self, id: InstrumentId, price: i64) {
        self.tell(TradingCmd::LastPrice(id, price)).await
    }

    /// Non-blocking; the price is dropped when the task is busy.
    pub(crate) fn offer_last_price(&self, id: InstrumentId, price: i64) {
        let _ = self.tx.try_send(TradingCmd::LastPrice(id, price));
    }

    pub(crate) async fn set_cash(&self, cash: i64) {
        self.tell(TradingCmd::Cash(cash)).await
    }

    pub(crate) async fn set_baseline(&self, positions: Vec<Position>) {
        self.tell(TradingCmd::Baseline(positions)).await
    }

    /// `requested_at` is when the order tables were asked for.
    pub(crate) async fn resync(
        &self,
        orders: Vec<OrderRow>,
        stops: Vec<StopOrderRow>,
        requested_at: DateTime<Utc>,
    ) -> Result<RestoreReport> {
        self.ask(|reply| TradingCmd::Resync {
            orders,
            stops,
            requested_at,
            reply,
        })
        .await
    }

    pub(crate) async fn snapshot(&self) -> Result<ReconcilerSnapshot> {
        self.ask(TradingCmd::Snapshot).await
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub(crate) async fn run(
    mut rec: Reconciler,
    mut cmds: mpsc::Receiver<TradingCmd>,
    mut events: mpsc::Receiver<BridgeEvent>,
    view: watch::Sender<ReconcilerView>,
    updates: broadcast::Sender<Order>,
    links: mpsc::UnboundedSender<FollowUp>,
) {
    let mut events_open = true;
    loop {
        let changed = tokio::select! {
            biased;
            cmd = cmds.recv() => match cmd {
                Some(cmd) => handle(&mut rec, cmd, &view),
                None => break,
            },
            ev = events.recv(), if events_open => match ev {
                Some(ev) => on_event(&mut rec, &ev),
                None => {
                    events_open = false;
                    false
                }
            },
        };
        if changed {
            view.send_replace(rec.view());
        }
        for order in rec.drain_notifications() {
            // No subscribers is fine.
            let _ = updates.send(order);
        }
        for follow_up in rec.drain_follow_ups() {
            if links.send(follow_up).is_err() {
                warn!(?follow_up, "linked order task stopped, follow-up dropped");
            }
        }
    }
    debug!("reconciler task finished");
}

fn on_event(rec: &mut Reconciler, ev: &BridgeEvent) -> bool {
    match ev {
        BridgeEvent::TerminalConnected => {
            info!("terminal connected to its server");
            false
        }
        BridgeEvent::TerminalDisconnected => {
            warn!("terminal lost its server connection");
            false
        }
        BridgeEvent::Other(name) => {
            debug!(event = %name, "unhandled bridge event");
            false
        }
        other => rec.apply_event(other, Utc::now()),
    }
}

fn current(rec: &Reconciler, order_ref: u64) -> Result<Order, ReconcileError> {
    rec.order(order_ref)
        .cloned()
        .ok_or(ReconcileError::UnknownOrder(order_ref))
}

/// Apply one command. Commands that reply publish the view first, so a
/// caller reading it after the reply sees its own change. Returns whether
/// the view still needs publishing.
fn handle(rec: &mut Reconciler, cmd: TradingCmd, view: &watch::Sender<ReconcilerView>) -> bool {
    let now = Utc::now();
    match cmd {
        TradingCmd::Create { req, reply } => {
            let trans_id = rec.allocate_trans_id(now.timestamp_millis());
            let order_ref = rec.create_order(req, trans_id, now);
            view.send_replace(rec.view());
            if let Ok(order) = current(rec, order_ref) {
                let _ = reply.send(order);
            }
            false
        }
        TradingCmd::Submitted {
            order_ref,
            ack_pending,
            reply,
        } => {
            let res = rec
                .mark_submitted(order_ref, ack_pending, now)
                .and_then(|()| current(rec, order_ref));
            view.send_replace(rec.view());
            let _ = reply.send(res);
            false
        }
        TradingCmd::Reject {
            order_ref,
            reason,
            reply,
        } => {
            let res = rec
                .reject_local(order_ref, reason, now)
                .and_then(|()| current(rec, order_ref));
            view.send_replace(rec.view());
            let _ = reply.send(res);
            false
        }
        TradingCmd::Cancel { order_ref, reply } => {
            let trans_id = rec.allocate_trans_id(now.timestamp_millis());
            let res = rec.request_cancel(order_ref, trans_id).map(|o| (o, trans_id));
            view.send_replace(rec.view());
            let _ = reply.send(res);
            false
        }
        TradingCmd::CancelFailed(order_ref) => {
            rec.cancel_failed(order_ref);
            true
        }
        TradingCmd::Instrument(inst) => {
            rec.register_instrument(inst);
            false
        }
        TradingCmd::LastPrice(id, price) => {
            rec.set_last_price(&id, price);
            true
        }
        TradingCmd::Cash(cash) => {
            rec.set_cash(cash);
            true
        }
        TradingCmd::Baseline(positions) => {
            info!(positions = positions.len(), "startup positions loaded");
            rec.set_baseline_positions(positions);
            true
        }
        TradingCmd::Resync {
            orders,
            stops,
            requested_at,
            reply,
        } => {
            let report = resync_orders(rec, &orders, &stops, requested_at, now);
            view.send_replace(rec.view());
            let _ = reply.send(report);
            false
        }
        TradingCmd::Snapshot(reply) => {
            let _ = reply.send(rec.snapshot());
            false
        }
    }
}
