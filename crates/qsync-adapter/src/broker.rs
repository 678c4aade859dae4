//! Order submission and cancellation.
//!
//! The order is created and moved to `Submitted` in the reconciler before the
//! transaction goes out, so a reply that races the command response always
//! finds it. Local failures (unknown instrument, zero lots, bridge error,
//! a transaction that never left) reject the order and are never retried.
//! A transaction that was written but not answered stays `Submitted`.
//!
//! Bracket parents (`transmit == false`, no parent) and their children stay
//! `New` until a child arrives with `transmit`; then the parent is sent and
//! the children go out from [`crate::links`] once it fills.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use qsync_protocol::commands;
use qsync_protocol::Command;
use qsync_reconcile::{
    build_cancel, build_new_order, Order, OrderRequest, OrderStatus, OrderType, TransactionContext,
};
use qsync_schemas::{price_to_micros, InstrumentId};

use crate::adapter::Shared;

pub(crate) const FUTURES_CLASS: &str = "SPBFUT";

/// Latest trade price from `getParamEx LAST`. `None` when the terminal has
/// none (no trades yet, or the param is not subscribed).
pub(crate) async fn last_price(shared: &Shared, id: &InstrumentId) -> Option<i64> {
    let data = match shared.session.call(Command::last_price(id)).await {
        Ok(data) => data,
        Err(e) => {
            warn!(instrument = %id, error = %e, "last price query failed");
            return None;
        }
    };
    let price = commands::parse_param_value(data)
        .filter(|p| *p > 0.0)
        .and_then(|p| price_to_micros(p).ok())?;
    shared.trading.set_last_price(id.clone(), price).await;
    Some(price)
}

/// Current copy of an order, for when the reconciler refused a local
/// update because a terminal event got there first.
fn settled(shared: &Shared, order_ref: u64, res: Result<Order>) -> Result<Order> {
    match res {
        Ok(order) => Ok(order),
        Err(e) => shared.order(order_ref).with_context(|| format!("{e:#}")),
    }
}

/// Create the order and send it, or hold it when it is part of a bracket
/// that is not transmitted yet. A transmitted bracket child sends its parent;
/// the children follow once the parent fills.
pub(crate) async fn submit(shared: &Shared, req: OrderRequest) -> Result<Order> {
    if !shared.session.is_connected() {
        bail!("session not connected, order not accepted");
    }
    if shared.routing().is_none() {
        bail!("trading account not resolved yet, order not accepted");
    }

    let order = shared.trading.create(req).await?;
    if order.status != OrderStatus::New {
        return Ok(order);
    }
    if !order.transmit {
        info!(order_ref = order.order_ref, parent = ?order.parent, "order held until the bracket is transmitted");
        return Ok(order);
    }
    match order.parent {
        Some(parent) => {
            place(shared, parent).await?;
            shared
                .order(order.order_ref)
                .with_context(|| format!("order {} vanished", order.order_ref))
        }
        None => place(shared, order.order_ref).await,
    }
}

/// Send a `New` order. Orders already sent or final are returned as they
/// are. Failures reject the order.
pub(crate) async fn place(shared: &Shared, order_ref: u64) -> Result<Order> {
    let order = shared
        .order(order_ref)
        .with_context(|| format!("unknown order {order_ref}"))?;
    if order.status != OrderStatus::New {
        return Ok(order);
    }
    let routing = match (shared.session.is_connected(), shared.routing()) {
        (true, Some(routing)) => routing,
        (false, _) => {
            let res = shared.trading.reject(order_ref, "session not connected").await;
            return settled(shared, order_ref, res);
        }
        (true, None) => {
            let res = shared.trading.reject(order_ref, "trading account not resolved").await;
            return settled(shared, order_ref, res);
        }
    };

    let inst = match shared.instruments.instrument(&shared.session, &order.instrument).await {
        Ok(inst) => inst,
        Err(e) => {
            let res = shared.trading.reject(order_ref, format!("invalid instrument: {e:#}")).await;
            return settled(shared, order_ref, res);
        }
    };
    shared.trading.register_instrument(inst.clone()).await;

    let derivative = inst.is_derivative(FUTURES_CLASS);
    let last = if derivative && order.order_type == OrderType::Market {
        last_price(shared, &inst.id).await
    } else {
        None
    };
    let ctx = TransactionContext {
        routing: &routing,
        lots: shared.cfg.lots,
        slippage_steps: shared.cfg.slippage_steps,
    };
    let fields = match build_new_order(&ctx, &order, &inst, derivative, last) {
        Ok(fields) => fields,
        Err(e) => {
            let res = shared.trading.reject(order_ref, e.to_string()).await;
            return settled(shared, order_ref, res);
        }
    };

    let submitted = shared.trading.submitted(order_ref, false).await?;
    match shared.session.call(Command::send_transaction(&fields)).await {
        Ok(_) => {
            info!(order_ref, trans_id = order.trans_id, instrument = %order.instrument, "transaction sent");
            Ok(submitted)
        }
        Err(e) if e.outcome_unknown() => {
            // The terminal may hold the transaction; only its reply decides.
            warn!(order_ref, trans_id = order.trans_id, error = %e, "transaction unacknowledged, awaiting terminal");
            let res = shared.trading.submitted(order_ref, true).await;
            settled(shared, order_ref, res)
        }
        Err(e) => {
            let res = shared.trading.reject(order_ref, e.to_string()).await;
            settled(shared, order_ref, res)
        }
    }
}

/// Send a kill transaction. Unknown refs, final orders and a second cancel
/// while one is in flight are refused with an error.
pub(crate) async fn cancel(shared: &Shared, order_ref: u64) -> Result<Order> {
    if !shared.session.is_connected() {
        bail!("session not connected, cancel not sent");
    }
    let routing = shared
        .routing()
        .context("trading account not resolved yet, cancel not sent")?;

    let (order, trans_id) = shared.trading.request_cancel(order_ref).await?;
    let ctx = TransactionContext {
        routing: &routing,
        lots: shared.cfg.lots,
        slippage_steps: shared.cfg.slippage_steps,
    };
    let fields = match build_cancel(&ctx, &order, trans_id) {
        Ok(fields) => fields,
        Err(e) => {
            shared.trading.cancel_failed(order_ref).await;
            return Err(e).context("cancel refused");
        }
    };

    match shared.session.call(Command::send_transaction(&fields)).await {
        Ok(_) => {
            info!(order_ref, trans_id, "cancel sent");
            Ok(order)
        }
        Err(e) if e.outcome_unknown() => {
            warn!(order_ref, trans_id, error = %e, "cancel unacknowledged, still in flight");
            Ok(order)
        }
        Err(e) => {
            shared.trading.cancel_failed(order_ref).await;
            Err(e).context("cancel transaction failed")
        }
    }
}
