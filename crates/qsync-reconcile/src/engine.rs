//! The reconciler: the one writer of orders, fills, positions and cash.
//!
//! Terminal events are applied through [`Reconciler::apply_event`]; every
//! query is a synchronous read. Events for transaction ids this adapter did
//! not issue (orders placed by hand in the terminal) are ignored.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use qsync_protocol::events::{OrderRow, OwnTrade, RowState, StopOrderRow, TransReply};
use qsync_protocol::{BridgeEvent, TransIdAllocator};
use qsync_schemas::{price_to_micros, Instrument, InstrumentId, Side};

use crate::account::CommissionModel;
use crate::id_map::{OrderIdMap, TransKind};
use crate::order::{Expiry, Order, OrderEvent, OrderStatus, OrderType, TransitionError};
use crate::position::{clamp_i64, mul_qty_price, Position};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One confirmed execution. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub order_ref: u64,
    /// Terminal trade number; unique per instrument.
    pub trade_num: u64,
    pub instrument: InstrumentId,
    pub side: Side,
    /// Units.
    pub qty: i64,
    pub price: i64,
    pub commission: i64,
    pub ts: Option<NaiveDateTime>,
}

/// Everything a new order needs before it gets a transaction id.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub instrument: InstrumentId,
    pub side: Side,
    /// Units, positive.
    pub size: i64,
    pub order_type: OrderType,
    pub price: Option<i64>,
    pub stop_price: Option<i64>,
    pub expiry: Expiry,
    /// Ref of an order to cancel when either of the two finishes.
    pub oco: Option<u64>,
    /// Ref of a held bracket parent. Children go out once it fills.
    pub parent: Option<u64>,
    /// `false` holds the order; the bracket is sent when a child arrives
    /// with `true`.
    pub transmit: bool,
}

/// Work the adapter owes the terminal because a linked order finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Send a held bracket child.
    Place(u64),
    /// Cancel a live OCO peer or bracket sibling.
    Cancel(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    UnknownOrder(u64),
    NotLive { order_ref: u64, status: OrderStatus },
    CancelInFlight(u64),
    Transition(TransitionError),
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::UnknownOrder(r) => write!(f, "unknown order ref {r}"),
            ReconcileError::NotLive { order_ref, status } => {
                write!(f, "order {order_ref} is {status:?}, not live")
            }
            ReconcileError::CancelInFlight(r) => write!(f, "cancel already in flight for order {r}"),
            ReconcileError::Transition(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<TransitionError> for ReconcileError {
    fn from(e: TransitionError) -> Self {
        ReconcileError::Transition(e)
    }
}

/// Read copy published to consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcilerView {
    pub orders: Vec<Order>,
    pub positions: Vec<Position>,
    pub cash: i64,
    pub equity: i64,
    pub fills: usize,
}

/// Trade numbers already applied for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillIds {
    pub instrument: InstrumentId,
    pub trade_nums: Vec<u64>,
}

/// Persisted reconciler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerSnapshot {
    pub orders: Vec<Order>,
    pub fills: Vec<Fill>,
    pub fill_ids: Vec<FillIds>,
    pub positions: Vec<Position>,
    pub cash: i64,
    pub last_order_ref: u64,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    orders: BTreeMap<u64, Order>,
    ids: OrderIdMap,
    fills: Vec<Fill>,
    seen_fills: BTreeMap<InstrumentId, BTreeSet<u64>>,
    positions: BTreeMap<InstrumentId, Position>,
    cash: i64,
    last_prices: BTreeMap<InstrumentId, i64>,
    instruments: BTreeMap<InstrumentId, Instrument>,
    /// Terminal quantities are in lots.
    lots: bool,
    commission: CommissionModel,
    notifications: VecDeque<Order>,
    follow_ups: VecDeque<FollowUp>,
    last_order_ref: u64,
}

impl Reconciler {
    pub fn new(lots: bool, commission: CommissionModel) -> Self {
        Self {
            lots,
            commission,
            ..Self::default()
        }
    }

    /// Rebuild from a snapshot. Index maps are derived, not persisted.
    pub fn restore(snapshot: ReconcilerSnapshot, lots: bool, commission: CommissionModel) -> Self {
        let mut r = Self::new(lots, commission);
        for o in snapshot.orders {
            r.ids.register_trans(o.trans_id, o.order_ref, TransKind::New);
            if let Some(c) = o.cancel_trans_id {
                r.ids.register_trans(c, o.order_ref, TransKind::Cancel);
            }
            if let Some(n) = o.order_num {
                r.ids.register_order_num(n, o.order_ref);
            }
            if let Some(n) = o.linked_order_num {
                r.ids.register_order_num(n, o.order_ref);
            }
            r.orders.insert(o.order_ref, o);
        }
        for ids in snapshot.fill_ids {
            r.seen_fills
                .entry(ids.instrument)
                .or_default()
                .extend(ids.trade_nums);
        }
        for p in snapshot.positions {
            r.positions.insert(p.instrument.clone(), p);
        }
        r.fills = snapshot.fills;
        r.cash = snapshot.cash;
        r.last_order_ref = snapshot
            .last_order_ref
            .max(r.orders.keys().next_back().copied().unwrap_or(0));
        r
    }

    pub fn snapshot(&self) -> ReconcilerSnapshot {
        ReconcilerSnapshot {
            orders: self.orders.values().cloned().collect(),
            fills: self.fills.clone(),
            fill_ids: self
                .seen_fills
                .iter()
                .map(|(instrument, nums)| FillIds {
                    instrument: instrument.clone(),
                    trade_nums: nums.iter().copied().collect(),
                })
                .collect(),
            positions: self.positions.values().cloned().collect(),
            cash: self.cash,
            last_order_ref: self.last_order_ref,
        }
    }

    // --- reference data -----------------------------------------------------

    pub fn register_instrument(&mut self, instrument: Instrument) {
        self.instruments.insert(instrument.id.clone(), instrument);
    }

    pub fn set_last_price(&mut self, id: &InstrumentId, price: i64) {
        self.last_prices.insert(id.clone(), price);
    }

    /// Terminal-reported balance replaces the locally derived cash.
    pub fn set_cash(&mut self, cash: i64) {
        self.cash = cash;
    }

    /// Startup positions from depo limits / futures holdings. Instruments
    /// absent from `baseline` keep their local position.
    pub fn set_baseline_positions(&mut self, baseline: Vec<Position>) {
        for p in baseline {
            self.positions.insert(p.instrument.clone(), p);
        }
    }

    // --- order lifecycle ----------------------------------------------------

    /// Next unused transaction id for `now_ms`.
    pub fn allocate_trans_id(&self, now_ms: i64) -> i64 {
        TransIdAllocator.next(now_ms, |id| self.ids.contains_trans(id))
    }

    /// Record a new order in `New`. Returns its local ref. An order whose
    /// OCO peer or bracket parent cannot be used is created `Rejected`.
    pub fn create_order(&mut self, req: OrderRequest, trans_id: i64, now: DateTime<Utc>) -> u64 {
        self.last_order_ref += 1;
        let order_ref = self.last_order_ref;
        let link_error = self.link_error(&req);
        let mut order = Order::new(
            order_ref,
            trans_id,
            req.instrument,
            req.side,
            req.size,
            req.order_type,
            req.price,
            req.stop_price,
            req.expiry,
            now,
        );
        order.oco = req.oco;
        order.parent = req.parent;
        order.transmit = req.transmit;
        self.ids.register_trans(trans_id, order_ref, TransKind::New);
        info!(
            order_ref,
            trans_id,
            instrument = %order.instrument,
            side = ?order.side,
            size = order.size,
            order_type = ?order.order_type,
            oco = ?order.oco,
            parent = ?order.parent,
            transmit = order.transmit,
            "order created"
        );
        self.orders.insert(order_ref, order);
        if let Some(reason) = link_error {
            // Only the new order is touched; its links are not followed.
            if let Some(o) = self.orders.get_mut(&order_ref) {
                warn!(order_ref, %reason, "order rejected locally");
                if let Ok(true) = o.apply(&OrderEvent::Rejected { reason }, now) {
                    self.notify(order_ref);
                }
            }
        }
        order_ref
    }

    fn link_error(&self, req: &OrderRequest) -> Option<String> {
        if let Some(peer) = req.oco {
            if !self.orders.contains_key(&peer) {
                return Some(format!("oco order {peer} not found"));
            }
        }
        if let Some(parent) = req.parent {
            let held = self
                .orders
                .get(&parent)
                .is_some_and(|p| p.is_bracket_parent() && p.status == OrderStatus::New);
            if !held {
                return Some(format!("parent order {parent} not found or already sent"));
            }
        }
        None
    }

    /// The bridge took the transaction. `ack_pending` when the command timed
    /// out and the terminal may or may not have it.
    pub fn mark_submitted(
        &mut self,
        order_ref: u64,
        ack_pending: bool,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let order = self
            .orders
            .get_mut(&order_ref)
            .ok_or(ReconcileError::UnknownOrder(order_ref))?;
        let changed = order.apply(&OrderEvent::Submitted, now)?;
        if order.status == OrderStatus::Submitted {
            order.ack_pending = ack_pending;
        }
        if ack_pending {
            warn!(order_ref, "submit not acknowledged in time, ack pending");
        }
        if changed {
            self.notify(order_ref);
        }
        Ok(())
    }

    /// Local failure before or while sending: zero lots, unknown instrument,
    /// bridge error. Never retried.
    pub fn reject_local(
        &mut self,
        order_ref: u64,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let reason = reason.into();
        let order = self
            .orders
            .get_mut(&order_ref)
            .ok_or(ReconcileError::UnknownOrder(order_ref))?;
        warn!(order_ref, %reason, "order rejected locally");
        if order.apply(&OrderEvent::Rejected { reason }, now)? {
            self.notify(order_ref);
            self.order_finished(order_ref, now);
        }
        Ok(())
    }

    /// Register a cancel transaction. Returns a copy of the order to build
    /// the kill transaction from.
    pub fn request_cancel(&mut self, order_ref: u64, trans_id: i64) -> Result<Order, ReconcileError> {
        let order = self
            .orders
            .get_mut(&order_ref)
            .ok_or(ReconcileError::UnknownOrder(order_ref))?;
        if !order.status.is_live() {
            return Err(ReconcileError::NotLive {
                order_ref,
                status: order.status,
            });
        }
        if order.cancel_trans_id.is_some() {
            return Err(ReconcileError::CancelInFlight(order_ref));
        }
        order.cancel_trans_id = Some(trans_id);
        self.ids.register_trans(trans_id, order_ref, TransKind::Cancel);
        info!(order_ref, trans_id, "cancel requested");
        Ok(order.clone())
    }

    /// The cancel never reached the terminal.
    pub fn cancel_failed(&mut self, order_ref: u64) {
        if let Some(o) = self.orders.get_mut(&order_ref) {
            o.cancel_trans_id = None;
        }
    }

    // --- terminal events ----------------------------------------------------

    /// Apply one trading event. Market events are ignored. Returns whether
    /// anything changed.
    pub fn apply_event(&mut self, event: &BridgeEvent, now: DateTime<Utc>) -> bool {
        match event {
            BridgeEvent::TransReply(r) => self.on_trans_reply(r, now),
            BridgeEvent::Order(row) => self.on_order(row, now),
            BridgeEvent::StopOrder(row) => self.on_stop_order(row, now),
            BridgeEvent::OwnTrade(t) => self.on_trade(t, now),
            _ => false,
        }
    }

    fn on_trans_reply(&mut self, r: &TransReply, now: DateTime<Utc>) -> bool {
        let Some((order_ref, kind)) = self.ids.by_trans(r.trans_id) else {
            debug!(trans_id = r.trans_id, "trans reply for a foreign transaction");
            return false;
        };
        if kind == TransKind::New && r.order_num != 0 {
            self.ids.register_order_num(r.order_num, order_ref);
            if let Some(o) = self.orders.get_mut(&order_ref) {
                o.order_num.get_or_insert(r.order_num);
            }
        }

        let event = match (r.status, kind) {
            (3 | 15, TransKind::New) => OrderEvent::Accepted,
            (3 | 15, TransKind::Cancel) => OrderEvent::Cancelled,
            (2 | 10..=14 | 16, TransKind::New) => OrderEvent::Rejected {
                reason: r.result_msg.clone(),
            },
            (2 | 10..=14 | 16, TransKind::Cancel) => {
                warn!(order_ref, status = r.status, msg = %r.result_msg, "cancel refused by terminal");
                self.cancel_failed(order_ref);
                return false;
            }
            (4 | 5, _) => {
                warn!(order_ref, status = r.status, msg = %r.result_msg, "transaction error, order unchanged");
                return false;
            }
            (6, TransKind::New) => OrderEvent::Rejected {
                reason: "margin".to_string(),
            },
            (6, TransKind::Cancel) => {
                self.cancel_failed(order_ref);
                return false;
            }
            (status, _) => {
                debug!(order_ref, status, "intermediate transaction status");
                return false;
            }
        };
        self.transition(order_ref, &event, now)
    }

    fn on_order(&mut self, row: &OrderRow, now: DateTime<Utc>) -> bool {
        let Some(order_ref) = self.lookup(row.trans_id, row.order_num) else {
            debug!(order_num = row.order_num, trans_id = row.trans_id, "order row for a foreign order");
            return false;
        };
        let Some(order) = self.orders.get(&order_ref) else {
            return false;
        };

        if order.order_type.is_stop() {
            // Only the limit order spawned by the stop matters here.
            if order.linked_order_num != Some(row.order_num) || row.order_num == 0 {
                return false;
            }
            let event = match row.state() {
                RowState::Canceled => OrderEvent::Rejected {
                    reason: "linked order cancelled".to_string(),
                },
                RowState::Completed => OrderEvent::Completed,
                RowState::Active => return false,
            };
            return self.transition(order_ref, &event, now);
        }

        self.ids.register_order_num(row.order_num, order_ref);
        if let Some(o) = self.orders.get_mut(&order_ref) {
            if row.order_num != 0 {
                o.order_num.get_or_insert(row.order_num);
            }
        }
        let event = match row.state() {
            RowState::Active => OrderEvent::Accepted,
            RowState::Canceled => OrderEvent::Cancelled,
            RowState::Completed => OrderEvent::Completed,
        };
        self.transition(order_ref, &event, now)
    }

    fn on_stop_order(&mut self, row: &StopOrderRow, now: DateTime<Utc>) -> bool {
        let Some(order_ref) = self.lookup(row.trans_id, row.order_num) else {
            debug!(order_num = row.order_num, "stop order row for a foreign order");
            return false;
        };
        let Some(order) = self.orders.get_mut(&order_ref) else {
            return false;
        };
        if row.order_num != 0 {
            order.order_num.get_or_insert(row.order_num);
        }
        match row.state() {
            RowState::Active => self.transition(order_ref, &OrderEvent::Accepted, now),
            RowState::Canceled => self.transition(order_ref, &OrderEvent::Cancelled, now),
            RowState::Completed => {
                if row.linked_order == 0 || order.linked_order_num == Some(row.linked_order) {
                    return false;
                }
                order.linked_order_num = Some(row.linked_order);
                order.updated_at = now;
                self.ids.register_order_num(row.linked_order, order_ref);
                info!(order_ref, linked_order = row.linked_order, "stop order triggered");
                self.notify(order_ref);
                true
            }
        }
    }

    fn on_trade(&mut self, t: &OwnTrade, now: DateTime<Utc>) -> bool {
        let Some(order_ref) = self.lookup(t.trans_id, t.order_num) else {
            debug!(trade_num = t.trade_num, trans_id = t.trans_id, "fill for a foreign order");
            return false;
        };
        let instrument = t.instrument();
        if !self
            .seen_fills
            .entry(instrument.clone())
            .or_default()
            .insert(t.trade_num)
        {
            debug!(order_ref, trade_num = t.trade_num, instrument = %instrument, "duplicate fill ignored");
            return false;
        }

        let price = match price_to_micros(t.price) {
            Ok(p) => p,
            Err(e) => {
                warn!(order_ref, trade_num = t.trade_num, error = %e, "fill with unusable price");
                return false;
            }
        };
        let unit_value = self.to_currency(&instrument, price);
        let (qty, fee) = match self.instruments.get(&instrument) {
            Some(inst) => {
                let qty = if self.lots { inst.lots_to_size(t.qty) } else { t.qty };
                (qty, self.commission.fee(inst, qty, unit_value, t.reported_commission()))
            }
            None => {
                warn!(instrument = %instrument, "fill on unresolved instrument, quantity taken as units");
                let unit = Instrument::new(instrument.clone(), 1, 1, 6);
                (t.qty, self.commission.fee(&unit, t.qty, unit_value, t.reported_commission()))
            }
        };
        let side = t.side();

        let fill = Fill {
            order_ref,
            trade_num: t.trade_num,
            instrument: instrument.clone(),
            side,
            qty,
            price,
            commission: fee,
            ts: t.ts(),
        };
        info!(
            order_ref,
            trade_num = t.trade_num,
            instrument = %instrument,
            side = ?side,
            qty,
            price,
            fee,
            "fill"
        );

        if let Some(o) = self.orders.get_mut(&order_ref) {
            if t.order_num != 0 && !o.order_type.is_stop() {
                o.order_num.get_or_insert(t.order_num);
            }
            if o.status.is_terminal() {
                o.record_late_fill(qty, price, now);
                self.notify(order_ref);
            } else {
                self.transition(order_ref, &OrderEvent::Fill { qty, price }, now);
            }
        }

        self.positions
            .entry(instrument.clone())
            .or_insert_with(|| Position::flat(instrument.clone()))
            .apply_fill(side, qty, price);
        let notional = clamp_i64(mul_qty_price(qty, unit_value));
        self.cash = match side {
            Side::Buy => self.cash.saturating_sub(notional),
            Side::Sell => self.cash.saturating_add(notional),
        }
        .saturating_sub(fee);
        self.last_prices.insert(instrument, price);
        self.fills.push(fill);
        true
    }

    fn lookup(&self, trans_id: i64, order_num: u64) -> Option<u64> {
        match self.ids.by_trans(trans_id) {
            Some((order_ref, _)) => Some(order_ref),
            None if order_num != 0 => self.ids.by_order_num(order_num),
            None => None,
        }
    }

    fn transition(&mut self, order_ref: u64, event: &OrderEvent, now: DateTime<Utc>) -> bool {
        let Some(order) = self.orders.get_mut(&order_ref) else {
            return false;
        };
        let from = order.status;
        match order.apply(event, now) {
            Ok(true) => {
                let finished = order.status.is_terminal();
                if finished {
                    order.cancel_trans_id = None;
                }
                info!(order_ref, from = ?from, to = ?order.status, "order transition");
                self.notify(order_ref);
                if finished {
                    self.order_finished(order_ref, now);
                }
                true
            }
            Ok(false) => {
                // Fills change quantities without always changing status.
                if matches!(event, OrderEvent::Fill { .. }) {
                    self.notify(order_ref);
                    return true;
                }
                false
            }
            Err(e) => {
                warn!(error = %e, "ignored order event");
                false
            }
        }
    }

    // --- linked orders ------------------------------------------------------

    /// `order_ref` reached a final status. OCO peers and bracket siblings
    /// are stopped; a filled bracket parent releases its children, any other
    /// end rejects them. Held orders are settled here, live ones become
    /// [`FollowUp`]s.
    pub(crate) fn order_finished(&mut self, order_ref: u64, now: DateTime<Utc>) {
        let mut queue = VecDeque::from([order_ref]);
        while let Some(done) = queue.pop_front() {
            let Some(order) = self.orders.get(&done) else {
                continue;
            };
            let filled = order.status == OrderStatus::Filled;
            let mut stop: Vec<u64> = order.oco.into_iter().collect();
            stop.extend(
                self.orders
                    .values()
                    .filter(|o| o.oco == Some(done))
                    .map(|o| o.order_ref),
            );
            let mut release = Vec::new();
            if order.is_bracket_parent() {
                let children = self.children(done);
                if filled {
                    release = children;
                } else {
                    stop.extend(children);
                }
            } else if let Some(parent) = order.parent {
                stop.extend(self.children(parent).into_iter().filter(|c| *c != done));
            }

            for child in release {
                if self.orders.get(&child).is_some_and(|o| o.status == OrderStatus::New) {
                    info!(parent = done, order_ref = child, "bracket child released");
                    self.follow_ups.push_back(FollowUp::Place(child));
                }
            }
            for linked in stop {
                let Some(o) = self.orders.get_mut(&linked) else {
                    continue;
                };
                match o.status {
                    OrderStatus::New => {
                        let reason = format!("linked order {done} finished");
                        if let Ok(true) = o.apply(&OrderEvent::Rejected { reason }, now) {
                            info!(order_ref = linked, by = done, "held order dropped");
                            self.notify(linked);
                            queue.push_back(linked);
                        }
                    }
                    s if s.is_live() && o.cancel_trans_id.is_none() => {
                        info!(order_ref = linked, by = done, "linked order to cancel");
                        self.follow_ups.push_back(FollowUp::Cancel(linked));
                    }
                    _ => {}
                }
            }
        }
    }

    fn children(&self, parent: u64) -> Vec<u64> {
        self.orders
            .values()
            .filter(|o| o.parent == Some(parent))
            .map(|o| o.order_ref)
            .collect()
    }

    /// Linked-order work queued since the last call.
    pub fn drain_follow_ups(&mut self) -> Vec<FollowUp> {
        self.follow_ups.drain(..).collect()
    }

    pub(crate) fn notify(&mut self, order_ref: u64) {
        if let Some(o) = self.orders.get(&order_ref) {
            self.notifications.push_back(o.clone());
        }
    }

    pub(crate) fn order_mut(&mut self, order_ref: u64) -> Option<&mut Order> {
        self.orders.get_mut(&order_ref)
    }

    // --- queries ------------------------------------------------------------

    /// Pending order updates in arrival order; empties the queue.
    pub fn drain_notifications(&mut self) -> Vec<Order> {
        self.notifications.drain(..).collect()
    }

    pub fn order(&self, order_ref: u64) -> Option<&Order> {
        self.orders.get(&order_ref)
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn live_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| o.status.is_live())
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn position(&self, id: &InstrumentId) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn cash(&self) -> i64 {
        self.cash
    }

    /// Quote → currency per unit through the instrument's reference data;
    /// unresolved instruments pass through.
    fn to_currency(&self, id: &InstrumentId, quote: i64) -> i64 {
        self.instruments
            .get(id)
            .map_or(quote, |inst| inst.quote_to_currency(quote))
    }

    /// Cash plus every position marked at its last price (average price when
    /// no trade has been seen), in currency.
    pub fn equity(&self) -> i64 {
        self.positions.values().fold(self.cash, |acc, p| {
            let quote = self.last_prices.get(&p.instrument).copied().unwrap_or(p.avg_price);
            acc.saturating_add(p.market_value(Some(self.to_currency(&p.instrument, quote))))
        })
    }

    pub fn last_order_ref(&self) -> u64 {
        self.last_order_ref
    }

    pub fn view(&self) -> ReconcilerView {
        ReconcilerView {
            orders: self.orders.values().cloned().collect(),
            positions: self.positions.values().cloned().collect(),
            cash: self.cash,
            equity: self.equity(),
            fills: self.fills.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PX: i64 = 1_000_000;

    fn sber() -> InstrumentId {
        InstrumentId::new("TQBR", "SBER")
    }

    fn rec() -> Reconciler {
        let mut r = Reconciler::new(false, CommissionModel::default());
        r.register_instrument(Instrument::new(sber(), 1, 10_000, 2));
        r
    }

    fn limit_buy(size: i64) -> OrderRequest {
        OrderRequest {
            instrument: sber(),
            side: Side::Buy,
            size,
            order_type: OrderType::Limit,
            price: Some(50 * PX),
            stop_price: None,
            expiry: Expiry::Gtc,
            oco: None,
            parent: None,
            transmit: true,
        }
    }

    fn reply(trans_id: i64, status: i64, order_num: u64) -> BridgeEvent {
        BridgeEvent::TransReply(TransReply {
            trans_id,
            status,
            result_msg: "msg".into(),
            order_num,
        })
    }

    #[test]
    fn trans_ids_skip_ones_in_use() {
        let mut r = rec();
        let id = r.allocate_trans_id(1_700_000_000_500);
        assert_eq!(id, 500);
        r.create_order(limit_buy(1), id, Utc::now());
        assert_eq!(r.allocate_trans_id(1_700_000_000_500), 501);
    }

    #[test]
    fn reply_statuses_map_to_transitions() {
        let now = Utc::now();
        for (status, expect) in [
            (3, OrderStatus::Accepted),
            (15, OrderStatus::Accepted),
            (2, OrderStatus::Rejected),
            (13, OrderStatus::Rejected),
            (4, OrderStatus::Submitted),
            (5, OrderStatus::Submitted),
            (6, OrderStatus::Rejected),
            (1, OrderStatus::Submitted),
        ] {
            let mut r = rec();
            let o = r.create_order(limit_buy(1), 10, now);
            r.mark_submitted(o, false, now).unwrap();
            r.apply_event(&reply(10, status, 900), now);
            assert_eq!(r.order(o).unwrap().status, expect, "status {status}");
            if status == 6 {
                assert_eq!(r.order(o).unwrap().reject_reason.as_deref(), Some("margin"));
            }
        }
    }

    #[test]
    fn cancel_reply_cancels_and_refusal_clears() {
        let now = Utc::now();
        let mut r = rec();
        let o = r.create_order(limit_buy(1), 10, now);
        r.mark_submitted(o, false, now).unwrap();
        r.apply_event(&reply(10, 3, 900), now);

        r.request_cancel(o, 11).unwrap();
        assert_eq!(r.request_cancel(o, 12), Err(ReconcileError::CancelInFlight(o)));
        r.apply_event(&reply(11, 12, 0), now);
        assert_eq!(r.order(o).unwrap().status, OrderStatus::Accepted);
        assert_eq!(r.order(o).unwrap().cancel_trans_id, None);

        r.request_cancel(o, 13).unwrap();
        r.apply_event(&reply(13, 3, 0), now);
        assert_eq!(r.order(o).unwrap().status, OrderStatus::Cancelled);
        assert!(matches!(
            r.request_cancel(o, 14),
            Err(ReconcileError::NotLive { status: OrderStatus::Cancelled, .. })
        ));
    }

    #[test]
    fn foreign_events_are_ignored() {
        let now = Utc::now();
        let mut r = rec();
        assert!(!r.apply_event(&reply(77, 3, 1), now));
        assert!(r.drain_notifications().is_empty());
    }

    #[test]
    fn stop_trigger_links_and_linked_row_resolves() {
        let now = Utc::now();
        let mut r = rec();
        let o = r.create_order(
            OrderRequest {
                order_type: OrderType::Stop,
                price: None,
                stop_price: Some(55 * PX),
                ..limit_buy(1)
            },
            20,
            now,
        );
        r.mark_submitted(o, false, now).unwrap();
        r.apply_event(&reply(20, 3, 700), now);
        assert_eq!(r.order(o).unwrap().order_num, Some(700));

        r.apply_event(
            &BridgeEvent::StopOrder(StopOrderRow {
                order_num: 700,
                trans_id: 20,
                flags: 0,
                linked_order: 701,
                class_code: "TQBR".into(),
                sec_code: "SBER".into(),
            }),
            now,
        );
        assert_eq!(r.order(o).unwrap().linked_order_num, Some(701));

        let row = |flags| OrderRow {
            order_num: 701,
            trans_id: 20,
            flags,
            price: 55.0,
            qty: 1,
            balance: 0,
            ext_order_status: 0,
            class_code: "TQBR".into(),
            sec_code: "SBER".into(),
        };
        assert_eq!(row(0).state(), RowState::Completed);
        r.apply_event(&BridgeEvent::Order(row(0)), now);
        assert_eq!(r.order(o).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn local_rejection_from_new() {
        let now = Utc::now();
        let mut r = rec();
        let o = r.create_order(limit_buy(1), 30, now);
        r.reject_local(o, "zero lots", now).unwrap();
        let notes = r.drain_notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].status, OrderStatus::Rejected);
        assert_eq!(notes[0].reject_reason.as_deref(), Some("zero lots"));
    }

    #[test]
    fn snapshot_restore_keeps_indexes() {
        let now = Utc::now();
        let mut r = rec();
        let o = r.create_order(limit_buy(1), 40, now);
        r.mark_submitted(o, false, now).unwrap();
        r.apply_event(&reply(40, 3, 990), now);

        let snap = r.snapshot();
        let mut back = Reconciler::restore(snap.clone(), false, CommissionModel::default());
        assert_eq!(back.snapshot(), snap);
        assert_eq!(back.last_order_ref(), 1);
        assert_eq!(back.allocate_trans_id(40), 41);

        // Terminal events still resolve through the rebuilt maps.
        back.apply_event(&reply(40, 3, 990), now);
        assert_eq!(back.order(o).unwrap().status, OrderStatus::Accepted);
    }

    fn trade(trans_id: i64, trade_num: u64, instrument: &InstrumentId, price: f64, qty: i64) -> BridgeEvent {
        BridgeEvent::OwnTrade(OwnTrade {
            trade_num,
            order_num: 0,
            trans_id,
            price,
            qty,
            flags: 0,
            class_code: instrument.class_code.clone(),
            sec_code: instrument.sec_code.clone(),
            datetime: qsync_protocol::wire::QuikDateTime::default(),
            exchange_comission: 0.0,
            broker_comission: 0.0,
            clearing_comission: 0.0,
            tech_center_comission: 0.0,
        })
    }

    fn accepted(r: &mut Reconciler, req: OrderRequest, trans_id: i64, now: DateTime<Utc>) -> u64 {
        let o = r.create_order(req, trans_id, now);
        r.mark_submitted(o, false, now).unwrap();
        r.apply_event(&reply(trans_id, 3, 1000 + trans_id as u64), now);
        o
    }

    #[test]
    fn oco_peer_is_cancelled_when_one_fills() {
        let now = Utc::now();
        let mut r = rec();
        let take = accepted(&mut r, limit_buy(1), 50, now);
        let stop = accepted(&mut r, OrderRequest { oco: Some(take), ..limit_buy(1) }, 51, now);
        assert!(r.drain_follow_ups().is_empty());

        r.apply_event(&trade(50, 1, &sber(), 50.0, 1), now);
        assert_eq!(r.order(take).unwrap().status, OrderStatus::Filled);
        assert_eq!(r.drain_follow_ups(), vec![FollowUp::Cancel(stop)]);

        // The peer's own cancel does not bounce back to the filled order.
        r.request_cancel(stop, 52).unwrap();
        r.apply_event(&reply(52, 3, 0), now);
        assert_eq!(r.order(stop).unwrap().status, OrderStatus::Cancelled);
        assert!(r.drain_follow_ups().is_empty());
    }

    #[test]
    fn held_oco_peer_is_dropped_locally() {
        let now = Utc::now();
        let mut r = rec();
        let held = r.create_order(OrderRequest { transmit: false, ..limit_buy(1) }, 60, now);
        let live = r.create_order(OrderRequest { oco: Some(held), ..limit_buy(1) }, 61, now);
        r.mark_submitted(live, false, now).unwrap();
        r.apply_event(&reply(61, 2, 0), now);
        assert_eq!(r.order(live).unwrap().status, OrderStatus::Rejected);
        let o = r.order(held).unwrap();
        assert_eq!(o.status, OrderStatus::Rejected);
        assert_eq!(o.reject_reason.as_deref(), Some("linked order 2 finished"));
        assert!(r.drain_follow_ups().is_empty());
    }

    #[test]
    fn bracket_children_go_out_when_parent_fills() {
        let now = Utc::now();
        let mut r = rec();
        let parent = r.create_order(OrderRequest { transmit: false, ..limit_buy(2) }, 70, now);
        let exit = OrderRequest { side: Side::Sell, parent: Some(parent), transmit: false, ..limit_buy(2) };
        let take = r.create_order(exit.clone(), 71, now);
        let stop = r.create_order(OrderRequest { transmit: true, ..exit }, 72, now);
        assert_eq!(r.order(take).unwrap().status, OrderStatus::New);

        r.mark_submitted(parent, false, now).unwrap();
        r.apply_event(&reply(70, 3, 700), now);
        r.apply_event(&trade(70, 1, &sber(), 50.0, 1), now);
        assert!(r.drain_follow_ups().is_empty(), "partial fill releases nothing");
        r.apply_event(&trade(70, 2, &sber(), 50.0, 1), now);
        assert_eq!(
            r.drain_follow_ups(),
            vec![FollowUp::Place(take), FollowUp::Place(stop)]
        );

        // First exit to fill cancels the other.
        r.mark_submitted(take, false, now).unwrap();
        r.mark_submitted(stop, false, now).unwrap();
        r.apply_event(&reply(71, 3, 710), now);
        r.apply_event(&reply(72, 3, 720), now);
        r.apply_event(&trade(71, 3, &sber(), 55.0, 2), now);
        assert_eq!(r.drain_follow_ups(), vec![FollowUp::Cancel(stop)]);
    }

    #[test]
    fn bracket_children_are_dropped_when_parent_is_cancelled() {
        let now = Utc::now();
        let mut r = rec();
        let parent = r.create_order(OrderRequest { transmit: false, ..limit_buy(1) }, 80, now);
        let child = r.create_order(
            OrderRequest { side: Side::Sell, parent: Some(parent), ..limit_buy(1) },
            81,
            now,
        );
        r.mark_submitted(parent, false, now).unwrap();
        r.apply_event(&reply(80, 3, 800), now);
        r.request_cancel(parent, 82).unwrap();
        r.apply_event(&reply(82, 3, 0), now);

        assert_eq!(r.order(parent).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(r.order(child).unwrap().status, OrderStatus::Rejected);
        assert!(r.drain_follow_ups().is_empty());
    }

    #[test]
    fn broken_links_reject_the_new_order() {
        let now = Utc::now();
        let mut r = rec();
        let o = r.create_order(OrderRequest { oco: Some(42), ..limit_buy(1) }, 90, now);
        assert_eq!(r.order(o).unwrap().reject_reason.as_deref(), Some("oco order 42 not found"));

        let sent = accepted(&mut r, limit_buy(1), 91, now);
        let o = r.create_order(OrderRequest { parent: Some(sent), ..limit_buy(1) }, 92, now);
        let o = r.order(o).unwrap();
        assert_eq!(o.status, OrderStatus::Rejected);
        assert!(o.reject_reason.as_deref().unwrap_or_default().contains("already sent"));
        assert_eq!(r.order(sent).unwrap().status, OrderStatus::Accepted);
    }

    #[test]
    fn bond_money_follows_nominal() {
        let now = Utc::now();
        let mut r = rec();
        let ofz = InstrumentId::new("TQOB", "SU26238RMFS4");
        r.register_instrument(Instrument {
            face_value_micros: 1_000 * PX,
            ..Instrument::new(ofz.clone(), 1, 1_000, 3)
        });
        let o = accepted(&mut r, OrderRequest { instrument: ofz.clone(), ..limit_buy(2) }, 95, now);
        r.apply_event(&trade(95, 1, &ofz, 98.5, 2), now);
        assert_eq!(r.order(o).unwrap().avg_fill_price, 98_500_000, "fills keep the quote");
        assert_eq!(r.cash(), -1_970 * PX);

        r.set_last_price(&ofz, 99 * PX);
        assert_eq!(r.equity(), 10 * PX);
    }
}
