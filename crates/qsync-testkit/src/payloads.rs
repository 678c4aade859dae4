//! Builders for the JSON tables the bridge pushes and returns.

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde_json::{json, Value};

use qsync_schemas::{micros_to_price, Bar, InstrumentId, SeriesKey, Side};

pub fn quik_datetime(ts: NaiveDateTime) -> Value {
    json!({
        "year": ts.year(),
        "month": ts.month(),
        "day": ts.day(),
        "hour": ts.hour(),
        "min": ts.minute(),
        "sec": ts.second(),
        "ms": ts.nanosecond() / 1_000_000,
        "week_day": ts.weekday().num_days_from_sunday(),
    })
}

/// `OnAllTrade` payload.
pub fn all_trade(id: &InstrumentId, trade_num: u64, price: f64, qty: i64, ts: NaiveDateTime) -> Value {
    json!({
        "trade_num": trade_num,
        "flags": 1,
        "price": price,
        "qty": qty,
        "class_code": id.class_code,
        "sec_code": id.sec_code,
        "datetime": quik_datetime(ts),
    })
}

/// Bar row as in `get_candles_from_data_source` answers and `NewCandle`.
pub fn candle(series: &SeriesKey, bar: &Bar) -> Value {
    json!({
        "open": micros_to_price(bar.open),
        "high": micros_to_price(bar.high),
        "low": micros_to_price(bar.low),
        "close": micros_to_price(bar.close),
        "volume": bar.volume,
        "datetime": quik_datetime(bar.open_time),
        "sec": series.instrument.sec_code,
        "class": series.instrument.class_code,
        "interval": series.timeframe.quik_code(),
    })
}

fn side_flag(side: Side) -> i64 {
    match side {
        Side::Buy => 0,
        Side::Sell => 0x4,
    }
}

/// `OnTrade` payload for an own fill.
#[allow(clippy::too_many_arguments)]
pub fn own_trade(
    id: &InstrumentId,
    trade_num: u64,
    order_num: u64,
    trans_id: i64,
    side: Side,
    price: f64,
    qty: i64,
    ts: NaiveDateTime,
) -> Value {
    json!({
        "trade_num": trade_num,
        "order_num": order_num,
        "trans_id": trans_id,
        "price": price,
        "qty": qty,
        "flags": side_flag(side),
        "class_code": id.class_code,
        "sec_code": id.sec_code,
        "datetime": quik_datetime(ts),
    })
}

/// Terminal order state for [`order_row`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFlag {
    Active,
    Canceled,
    Completed,
}

/// `OnOrder` payload / `get_orders` row.
pub fn order_row(
    id: &InstrumentId,
    order_num: u64,
    trans_id: i64,
    side: Side,
    state: RowFlag,
    qty: i64,
    balance: i64,
) -> Value {
    let state_bits = match state {
        RowFlag::Active => 0x1,
        RowFlag::Canceled => 0x2,
        RowFlag::Completed => 0,
    };
    json!({
        "order_num": order_num,
        "trans_id": trans_id,
        "flags": state_bits | side_flag(side),
        "price": 0,
        "qty": qty,
        "balance": balance,
        "ext_order_status": 0,
        "class_code": id.class_code,
        "sec_code": id.sec_code,
    })
}

/// `OnTransReply` payload.
pub fn trans_reply(trans_id: i64, status: i64, order_num: u64, msg: &str) -> Value {
    json!({
        "trans_id": trans_id,
        "status": status,
        "order_num": order_num,
        "result_msg": msg,
    })
}
