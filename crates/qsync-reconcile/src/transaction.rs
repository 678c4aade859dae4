//! `sendTransaction` field maps for new orders and cancels.

use std::collections::BTreeMap;

use qsync_schemas::prices::format_price;
use qsync_schemas::{Instrument, Side};

use crate::account::AccountRouting;
use crate::order::{Order, OrderType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Size converts to zero whole lots.
    ZeroLots { size: i64, lot_size: i64 },
    /// Limit-type order without a limit price, or stop without a stop price.
    MissingPrice(&'static str),
    /// Market order on a derivative needs a last price.
    NoLastPrice,
    /// Nothing on the terminal to cancel yet.
    NotCancellable(u64),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::ZeroLots { size, lot_size } => {
                write!(f, "size {size} is less than one lot of {lot_size}")
            }
            BuildError::MissingPrice(which) => write!(f, "order needs a {which} price"),
            BuildError::NoLastPrice => write!(f, "no last price for a derivative market order"),
            BuildError::NotCancellable(r) => write!(f, "order {r} has no terminal order number"),
        }
    }
}

impl std::error::Error for BuildError {}

/// Static inputs shared by every transaction of one adapter.
#[derive(Debug, Clone)]
pub struct TransactionContext<'a> {
    pub routing: &'a AccountRouting,
    pub lots: bool,
    pub slippage_steps: i64,
}

/// Wire quantity and the size it really represents. Lot mode floors to whole
/// lots; zero lots is an error.
pub fn quantity(instrument: &Instrument, size: i64, lots: bool) -> Result<(i64, i64), BuildError> {
    let size = size.abs();
    if !lots {
        return Ok((size, size));
    }
    let wire = instrument.size_to_lots(size);
    if wire <= 0 {
        return Err(BuildError::ZeroLots {
            size,
            lot_size: instrument.lot_size,
        });
    }
    Ok((wire, instrument.lots_to_size(wire)))
}

fn worse_by_slippage(price: i64, side: Side, instrument: &Instrument, steps: i64) -> i64 {
    let slip = instrument.tick_size_micros.saturating_mul(steps);
    instrument.valid_price(price.saturating_add(side.sign() * slip))
}

fn put(fields: &mut BTreeMap<String, String>, k: &str, v: impl Into<String>) {
    fields.insert(k.to_string(), v.into());
}

/// Fields for a new order. `derivative` selects the slippage rule; `last_price`
/// is only consulted for derivative market orders.
pub fn build_new_order(
    ctx: &TransactionContext<'_>,
    order: &Order,
    instrument: &Instrument,
    derivative: bool,
    last_price: Option<i64>,
) -> Result<BTreeMap<String, String>, BuildError> {
    let (qty, _) = quantity(instrument, order.size, ctx.lots)?;
    let px = |p: i64| format_price(instrument.valid_price(p), instrument.scale);

    let mut f = BTreeMap::new();
    put(&mut f, "TRANS_ID", order.trans_id.to_string());
    put(&mut f, "CLIENT_CODE", ctx.routing.order_client_code.as_str());
    put(&mut f, "ACCOUNT", ctx.routing.trade_account_id.as_str());
    put(&mut f, "CLASSCODE", order.instrument.class_code.as_str());
    put(&mut f, "SECCODE", order.instrument.sec_code.as_str());
    put(&mut f, "OPERATION", order.side.operation_code());
    put(&mut f, "QUANTITY", qty.to_string());

    let zero = format_price(0, instrument.scale);
    match order.order_type {
        OrderType::Market => {
            put(&mut f, "ACTION", "NEW_ORDER");
            put(&mut f, "TYPE", "M");
            let price = if derivative {
                let last = last_price.ok_or(BuildError::NoLastPrice)?;
                let p = worse_by_slippage(last, order.side, instrument, ctx.slippage_steps);
                format_price(p, instrument.scale)
            } else {
                zero
            };
            put(&mut f, "PRICE", price);
        }
        OrderType::Limit => {
            put(&mut f, "ACTION", "NEW_ORDER");
            put(&mut f, "TYPE", "L");
            put(&mut f, "PRICE", px(order.price.ok_or(BuildError::MissingPrice("limit"))?));
        }
        OrderType::Stop => {
            put(&mut f, "ACTION", "NEW_STOP_ORDER");
            let stop = instrument.valid_price(order.stop_price.ok_or(BuildError::MissingPrice("stop"))?);
            put(&mut f, "STOPPRICE", format_price(stop, instrument.scale));
            let price = if derivative {
                format_price(
                    worse_by_slippage(stop, order.side, instrument, ctx.slippage_steps),
                    instrument.scale,
                )
            } else {
                zero
            };
            put(&mut f, "PRICE", price);
            put(&mut f, "EXPIRY_DATE", order.expiry.wire());
        }
        OrderType::StopLimit => {
            put(&mut f, "ACTION", "NEW_STOP_ORDER");
            put(&mut f, "STOPPRICE", px(order.stop_price.ok_or(BuildError::MissingPrice("stop"))?));
            put(&mut f, "PRICE", px(order.price.ok_or(BuildError::MissingPrice("limit"))?));
            put(&mut f, "EXPIRY_DATE", order.expiry.wire());
        }
    }
    Ok(f)
}

/// Fields for cancelling `order` under `trans_id`. An untriggered stop is
/// killed as a stop order; once triggered, its linked limit order is killed.
pub fn build_cancel(
    ctx: &TransactionContext<'_>,
    order: &Order,
    trans_id: i64,
) -> Result<BTreeMap<String, String>, BuildError> {
    let mut f = BTreeMap::new();
    put(&mut f, "TRANS_ID", trans_id.to_string());
    put(&mut f, "CLIENT_CODE", ctx.routing.order_client_code.as_str());
    put(&mut f, "ACCOUNT", ctx.routing.trade_account_id.as_str());
    put(&mut f, "CLASSCODE", order.instrument.class_code.as_str());
    put(&mut f, "SECCODE", order.instrument.sec_code.as_str());

    if order.order_type.is_stop() {
        if let Some(linked) = order.linked_order_num {
            put(&mut f, "ACTION", "KILL_ORDER");
            put(&mut f, "ORDER_KEY", linked.to_string());
            return Ok(f);
        }
        let key = order.order_num.ok_or(BuildError::NotCancellable(order.order_ref))?;
        put(&mut f, "ACTION", "KILL_STOP_ORDER");
        put(&mut f, "STOP_ORDER_KEY", key.to_string());
        return Ok(f);
    }

    let key = order.order_num.ok_or(BuildError::NotCancellable(order.order_ref))?;
    put(&mut f, "ACTION", "KILL_ORDER");
    put(&mut f, "ORDER_KEY", key.to_string());
    Ok(f)
}
