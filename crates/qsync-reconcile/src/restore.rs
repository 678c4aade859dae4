//! Re-sync live orders with the terminal's order tables, after a restart and
//! on every reconnect.
//!
//! Matching is by transaction id. Stop orders are looked up in the stop
//! table, everything else in the order table:
//!
//! | terminal row            | local status      |
//! |-------------------------|-------------------|
//! | ACTIVE, ext status 2    | PartiallyFilled   |
//! | ACTIVE                  | Accepted          |
//! | CANCELED                | Cancelled         |
//! | COMPLETED               | Filled            |
//! | (absent from both)      | Expired, see below|
//!
//! A live status only moves forward: a row that reports less progress than
//! the local order (ACTIVE for a partially filled order) leaves it alone.
//!
//! Absence from a table proves little. Only an order the terminal confirmed
//! (it has an order number) and that saw no event after the tables were
//! requested is expired. An unconfirmed order stays `Submitted` with its
//! acknowledgment pending; a late reply still resolves it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use qsync_protocol::events::{OrderRow, RowState, StopOrderRow};

use crate::engine::Reconciler;
use crate::order::{Order, OrderStatus};

/// Outcome of one resync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub matched: usize,
    pub expired: usize,
    pub changed: usize,
    /// Absent from both tables but not provably gone.
    pub unconfirmed: usize,
}

fn status_for(state: RowState, partially_filled: bool) -> OrderStatus {
    match state {
        RowState::Active if partially_filled => OrderStatus::PartiallyFilled,
        RowState::Active => OrderStatus::Accepted,
        RowState::Canceled => OrderStatus::Cancelled,
        RowState::Completed => OrderStatus::Filled,
    }
}

/// Progress of a live order; final statuses outrank every live one.
fn rank(status: OrderStatus) -> u8 {
    match status {
        OrderStatus::New => 0,
        OrderStatus::Submitted => 1,
        OrderStatus::Accepted => 2,
        OrderStatus::PartiallyFilled => 3,
        OrderStatus::Filled
        | OrderStatus::Cancelled
        | OrderStatus::Rejected
        | OrderStatus::Expired => 4,
    }
}

/// What the tables say about one live order.
enum Finding {
    Row(OrderStatus),
    Gone,
    Unknown,
}

fn find(
    order: &mut Order,
    by_trans: &HashMap<i64, &OrderRow>,
    stops_by_trans: &HashMap<i64, &StopOrderRow>,
    requested_at: DateTime<Utc>,
) -> Finding {
    let found = if order.order_type.is_stop() {
        stops_by_trans.get(&order.trans_id).map(|row| {
            if row.order_num != 0 {
                order.order_num.get_or_insert(row.order_num);
            }
            if row.linked_order != 0 {
                order.linked_order_num = Some(row.linked_order);
            }
            status_for(row.state(), false)
        })
    } else {
        by_trans.get(&order.trans_id).map(|row| {
            if row.order_num != 0 {
                order.order_num.get_or_insert(row.order_num);
            }
            if row.qty > 0 && row.balance < row.qty {
                order.filled = order.filled.max(row.qty - row.balance);
            }
            status_for(row.state(), row.is_partially_filled())
        })
    };
    match found {
        Some(status) => Finding::Row(status),
        None if order.order_num.is_some() && order.updated_at < requested_at => Finding::Gone,
        None => Finding::Unknown,
    }
}

/// Apply the terminal's view to every live local order. `requested_at` is
/// when the tables were asked for; orders touched since are never expired.
pub fn resync_orders(
    rec: &mut Reconciler,
    orders: &[OrderRow],
    stop_orders: &[StopOrderRow],
    requested_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> RestoreReport {
    let by_trans: HashMap<i64, &OrderRow> = orders.iter().map(|r| (r.trans_id, r)).collect();
    let stops_by_trans: HashMap<i64, &StopOrderRow> =
        stop_orders.iter().map(|r| (r.trans_id, r)).collect();

    let live: Vec<u64> = rec.live_orders().map(|o| o.order_ref).collect();
    let mut report = RestoreReport::default();
    let mut finished = Vec::new();

    for order_ref in live {
        let Some(order) = rec.order_mut(order_ref) else {
            continue;
        };
        let target = match find(order, &by_trans, &stops_by_trans, requested_at) {
            Finding::Row(status) => {
                report.matched += 1;
                order.ack_pending = false;
                status
            }
            Finding::Gone => {
                report.expired += 1;
                OrderStatus::Expired
            }
            Finding::Unknown => {
                report.unconfirmed += 1;
                if order.status == OrderStatus::Submitted && !order.ack_pending {
                    warn!(order_ref, trans_id = order.trans_id, "order not in terminal tables, ack pending");
                    order.ack_pending = true;
                    rec.notify(order_ref);
                }
                continue;
            }
        };
        if rank(target) <= rank(order.status) {
            continue;
        }
        info!(order_ref, from = ?order.status, to = ?target, "order resynced from terminal");
        order.status = target;
        order.ack_pending = false;
        order.updated_at = now;
        if target.is_terminal() {
            order.cancel_trans_id = None;
            finished.push(order_ref);
        }
        report.changed += 1;
        rec.notify(order_ref);
    }
    for order_ref in finished {
        rec.order_finished(order_ref, now);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::account::CommissionModel;
    use crate::engine::OrderRequest;
    use crate::order::{Expiry, OrderType};
    use qsync_schemas::{InstrumentId, Side};

    fn req(order_type: OrderType) -> OrderRequest {
        OrderRequest {
            instrument: InstrumentId::new("TQBR", "SBER"),
            side: Side::Buy,
            size: 10,
            order_type,
            price: Some(1_000_000),
            stop_price: Some(1_000_000),
            expiry: Expiry::Gtc,
            oco: None,
            parent: None,
            transmit: true,
        }
    }

    fn row(trans_id: i64, flags: i64, qty: i64, balance: i64, ext: i64) -> OrderRow {
        OrderRow {
            order_num: 1000 + trans_id as u64,
            trans_id,
            flags,
            price: 1.0,
            qty,
            balance,
            ext_order_status: ext,
            class_code: "TQBR".into(),
            sec_code: "SBER".into(),
        }
    }

    fn reply(trans_id: i64, status: i64, order_num: u64) -> qsync_protocol::BridgeEvent {
        qsync_protocol::BridgeEvent::TransReply(qsync_protocol::events::TransReply {
            trans_id,
            status,
            result_msg: String::new(),
            order_num,
        })
    }

    #[test]
    fn every_row_state_maps() {
        let now = Utc::now();
        let requested_at = now + Duration::seconds(1);
        let mut rec = Reconciler::new(false, CommissionModel::default());
        let mut refs = Vec::new();
        for t in 1..=6 {
            let ty = if t == 5 { OrderType::Stop } else { OrderType::Limit };
            let r = rec.create_order(req(ty), t, now);
            rec.mark_submitted(r, false, now).unwrap();
            refs.push(r);
        }
        rec.apply_event(&reply(6, 3, 1006), now);
        let orders = [
            row(1, 0x1, 10, 10, 0),
            row(2, 0x1, 10, 4, 2),
            row(3, 0x2, 10, 10, 0),
            row(4, 0x0, 10, 0, 0),
        ];
        let stops = [StopOrderRow {
            order_num: 77,
            trans_id: 5,
            flags: 0x1,
            linked_order: 0,
            class_code: "TQBR".into(),
            sec_code: "SBER".into(),
        }];
        rec.drain_notifications();

        let report = resync_orders(&mut rec, &orders, &stops, requested_at, requested_at);
        let st = |i: usize| rec.order(refs[i]).unwrap().status;
        assert_eq!(st(0), OrderStatus::Accepted);
        assert_eq!(st(1), OrderStatus::PartiallyFilled);
        assert_eq!(rec.order(refs[1]).unwrap().filled, 6);
        assert_eq!(st(2), OrderStatus::Cancelled);
        assert_eq!(st(3), OrderStatus::Filled);
        assert_eq!(st(4), OrderStatus::Accepted);
        assert_eq!(rec.order(refs[4]).unwrap().order_num, Some(77));
        assert_eq!(st(5), OrderStatus::Expired, "confirmed and absent from both tables");
        assert_eq!(
            report,
            RestoreReport { matched: 5, expired: 1, changed: 6, unconfirmed: 0 }
        );
        assert_eq!(rec.drain_notifications().len(), 6);
    }

    #[test]
    fn unconfirmed_order_waits_for_its_reply() {
        let now = Utc::now();
        let mut rec = Reconciler::new(false, CommissionModel::default());
        let r = rec.create_order(req(OrderType::Limit), 1, now);
        rec.mark_submitted(r, false, now).unwrap();
        rec.drain_notifications();

        let later = now + Duration::seconds(5);
        let report = resync_orders(&mut rec, &[], &[], later, later);
        assert_eq!(report.unconfirmed, 1);
        assert_eq!(report.expired, 0);
        let o = rec.order(r).unwrap();
        assert_eq!(o.status, OrderStatus::Submitted);
        assert!(o.ack_pending);
        assert_eq!(rec.drain_notifications().len(), 1);

        // A second pass does not notify again.
        resync_orders(&mut rec, &[], &[], later, later);
        assert!(rec.drain_notifications().is_empty());

        rec.apply_event(&reply(1, 3, 500), later);
        let o = rec.order(r).unwrap();
        assert_eq!(o.status, OrderStatus::Accepted);
        assert!(!o.ack_pending);
    }

    #[test]
    fn order_touched_after_the_request_is_kept() {
        let now = Utc::now();
        let mut rec = Reconciler::new(false, CommissionModel::default());
        let r = rec.create_order(req(OrderType::Limit), 1, now);
        rec.mark_submitted(r, false, now).unwrap();
        let requested_at = now + Duration::seconds(1);
        rec.apply_event(&reply(1, 3, 500), requested_at + Duration::milliseconds(10));

        let report = resync_orders(&mut rec, &[], &[], requested_at, requested_at + Duration::seconds(1));
        assert_eq!(report.expired, 0);
        assert_eq!(rec.order(r).unwrap().status, OrderStatus::Accepted);
    }

    #[test]
    fn progress_is_never_rolled_back() {
        let now = Utc::now();
        let mut rec = Reconciler::new(false, CommissionModel::default());
        let r = rec.create_order(req(OrderType::Limit), 2, now);
        rec.mark_submitted(r, false, now).unwrap();
        // Partial fill reported earlier, table row lags behind.
        resync_orders(&mut rec, &[row(2, 0x1, 10, 4, 2)], &[], now, now);
        assert_eq!(rec.order(r).unwrap().status, OrderStatus::PartiallyFilled);
        rec.drain_notifications();

        let report = resync_orders(&mut rec, &[row(2, 0x1, 10, 10, 0)], &[], now, now);
        assert_eq!(report.matched, 1);
        assert_eq!(report.changed, 0);
        let o = rec.order(r).unwrap();
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert_eq!(o.filled, 6);
        assert!(rec.drain_notifications().is_empty());
    }

    #[test]
    fn fill_found_in_tables_cancels_oco_peer() {
        let now = Utc::now();
        let mut rec = Reconciler::new(false, CommissionModel::default());
        let a = rec.create_order(req(OrderType::Limit), 1, now);
        let b = rec.create_order(OrderRequest { oco: Some(a), ..req(OrderType::Limit) }, 2, now);
        for r in [a, b] {
            rec.mark_submitted(r, false, now).unwrap();
        }
        resync_orders(&mut rec, &[row(1, 0x0, 10, 0, 0), row(2, 0x1, 10, 10, 0)], &[], now, now);
        assert_eq!(rec.order(a).unwrap().status, OrderStatus::Filled);
        assert_eq!(rec.drain_follow_ups(), vec![crate::engine::FollowUp::Cancel(b)]);
    }

    #[test]
    fn terminal_orders_are_left_alone() {
        let now = Utc::now();
        let mut rec = Reconciler::new(false, CommissionModel::default());
        let r = rec.create_order(req(OrderType::Limit), 1, now);
        rec.reject_local(r, "x", now).unwrap();
        let report = resync_orders(&mut rec, &[], &[], now, now);
        assert_eq!(report, RestoreReport::default());
        assert_eq!(rec.order(r).unwrap().status, OrderStatus::Rejected);
    }
}
