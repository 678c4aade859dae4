//! Typed event payloads.
//!
//! Market events (`OnAllTrade`, `NewCandle`) are converted into domain types
//! here. Trading rows keep the terminal's field layout; the reconciler reads
//! them through the accessor methods.

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value;

use qsync_schemas::{Bar, InstrumentId, SeriesKey, Side, Tick, Timeframe};

use crate::frame::{DecodeError, EventFrame};
use crate::wire::{f64_lenient, i64_lenient, micros, u64_lenient, QuikDateTime};

const FLAG_ACTIVE: i64 = 0x1;
const FLAG_CANCELED: i64 = 0x2;
const FLAG_SELL: i64 = 0x4;

// ---------------------------------------------------------------------------
// Trading rows
// ---------------------------------------------------------------------------

/// Row state encoded in the low bits of `flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Active,
    Canceled,
    Completed,
}

fn row_state(flags: i64) -> RowState {
    if flags & FLAG_ACTIVE != 0 {
        RowState::Active
    } else if flags & FLAG_CANCELED != 0 {
        RowState::Canceled
    } else {
        RowState::Completed
    }
}

fn row_side(flags: i64) -> Side {
    if flags & FLAG_SELL != 0 {
        Side::Sell
    } else {
        Side::Buy
    }
}

/// Own fill (`OnTrade`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OwnTrade {
    #[serde(deserialize_with = "u64_lenient", default)]
    pub trade_num: u64,
    #[serde(deserialize_with = "u64_lenient", default)]
    pub order_num: u64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub trans_id: i64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub price: f64,
    /// Lots when the terminal runs in lot mode.
    #[serde(deserialize_with = "i64_lenient", default)]
    pub qty: i64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub flags: i64,
    #[serde(default)]
    pub class_code: String,
    #[serde(default)]
    pub sec_code: String,
    #[serde(default)]
    pub datetime: QuikDateTime,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub exchange_comission: f64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub broker_comission: f64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub clearing_comission: f64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub tech_center_comission: f64,
}

impl OwnTrade {
    pub fn instrument(&self) -> InstrumentId {
        InstrumentId::new(&self.class_code, &self.sec_code)
    }

    pub fn side(&self) -> Side {
        row_side(self.flags)
    }

    pub fn ts(&self) -> Option<NaiveDateTime> {
        self.datetime.to_naive()
    }

    /// Sum of the terminal-reported fees, in currency units.
    pub fn reported_commission(&self) -> f64 {
        self.exchange_comission
            + self.broker_comission
            + self.clearing_comission
            + self.tech_center_comission
    }
}

/// Order table row (`OnOrder`, `get_orders`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderRow {
    #[serde(deserialize_with = "u64_lenient", default)]
    pub order_num: u64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub trans_id: i64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub flags: i64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub price: f64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub qty: i64,
    /// Unfilled remainder.
    #[serde(deserialize_with = "i64_lenient", default)]
    pub balance: i64,
    /// Exchange-side status; `2` marks a partially filled order.
    #[serde(deserialize_with = "i64_lenient", default)]
    pub ext_order_status: i64,
    #[serde(default)]
    pub class_code: String,
    #[serde(default)]
    pub sec_code: String,
}

impl OrderRow {
    pub fn state(&self) -> RowState {
        row_state(self.flags)
    }

    pub fn side(&self) -> Side {
        row_side(self.flags)
    }

    pub fn is_partially_filled(&self) -> bool {
        self.ext_order_status == 2
    }
}

/// Stop-order table row (`OnStopOrder`, `get_stop_orders`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StopOrderRow {
    #[serde(deserialize_with = "u64_lenient", default)]
    pub order_num: u64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub trans_id: i64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub flags: i64,
    /// Limit order created when the stop triggered; 0 until then.
    #[serde(deserialize_with = "u64_lenient", default)]
    pub linked_order: u64,
    #[serde(default)]
    pub class_code: String,
    #[serde(default)]
    pub sec_code: String,
}

impl StopOrderRow {
    pub fn state(&self) -> RowState {
        row_state(self.flags)
    }
}

/// Transaction reply (`OnTransReply`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransReply {
    #[serde(deserialize_with = "i64_lenient", default)]
    pub trans_id: i64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub status: i64,
    #[serde(default)]
    pub result_msg: String,
    #[serde(deserialize_with = "u64_lenient", default)]
    pub order_num: u64,
}

// ---------------------------------------------------------------------------
// Market rows
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawAllTrade {
    #[serde(deserialize_with = "u64_lenient", default)]
    trade_num: u64,
    #[serde(deserialize_with = "f64_lenient", default)]
    price: f64,
    #[serde(deserialize_with = "f64_lenient", default)]
    qty: f64,
    #[serde(default)]
    class_code: String,
    #[serde(default)]
    sec_code: String,
    #[serde(default)]
    datetime: QuikDateTime,
}

/// Bar row as returned by `get_candles_from_data_source` and pushed by
/// `NewCandle`.
#[derive(Debug, Clone, Deserialize)]
pub struct CandleRow {
    #[serde(deserialize_with = "f64_lenient", default)]
    pub open: f64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub high: f64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub low: f64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub close: f64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub volume: f64,
    #[serde(default)]
    pub datetime: QuikDateTime,
    #[serde(default)]
    pub sec: String,
    #[serde(default)]
    pub class: String,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub interval: i64,
}

impl CandleRow {
    pub fn to_bar(&self) -> Result<Bar, String> {
        let open_time = self
            .datetime
            .to_naive()
            .ok_or_else(|| format!("bad candle datetime {:?}", self.datetime))?;
        let px = |p: f64| micros(p).map_err(|e| e.to_string());
        Ok(Bar {
            open_time,
            open: px(self.open)?,
            high: px(self.high)?,
            low: px(self.low)?,
            close: px(self.close)?,
            volume: self.volume.round() as i64,
        })
    }

    /// Series the row belongs to, when it carries its own identity.
    pub fn series(&self) -> Option<SeriesKey> {
        let tf = Timeframe::from_quik_code(u32::try_from(self.interval).ok()?)?;
        if self.class.is_empty() || self.sec.is_empty() {
            return None;
        }
        Some(SeriesKey::new(InstrumentId::new(&self.class, &self.sec), tf))
    }
}

// ---------------------------------------------------------------------------
// BridgeEvent
// ---------------------------------------------------------------------------

/// Event names as sent by the bridge.
pub mod names {
    pub const ALL_TRADE: &str = "OnAllTrade";
    pub const NEW_CANDLE: &str = "NewCandle";
    pub const TRADE: &str = "OnTrade";
    pub const ORDER: &str = "OnOrder";
    pub const STOP_ORDER: &str = "OnStopOrder";
    pub const TRANS_REPLY: &str = "OnTransReply";
    pub const CONNECTED: &str = "OnConnected";
    pub const DISCONNECTED: &str = "OnDisconnected";
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Tick(Tick),
    Candle { series: SeriesKey, bar: Bar },
    OwnTrade(OwnTrade),
    Order(OrderRow),
    StopOrder(StopOrderRow),
    TransReply(TransReply),
    /// Terminal regained its server connection.
    TerminalConnected,
    /// Terminal lost its server connection.
    TerminalDisconnected,
    Other(String),
}

impl BridgeEvent {
    pub fn decode(frame: EventFrame) -> Result<Self, DecodeError> {
        let EventFrame { name, data, .. } = frame;
        let fail = |reason: String| DecodeError::Payload {
            event: name.clone(),
            reason,
        };

        let ev = match name.as_str() {
            names::ALL_TRADE => {
                let raw: RawAllTrade = from_data(data).map_err(&fail)?;
                let ts = raw
                    .datetime
                    .to_naive()
                    .ok_or_else(|| fail("bad trade datetime".to_string()))?;
                let price = micros(raw.price).map_err(|e| fail(e.to_string()))?;
                BridgeEvent::Tick(Tick {
                    instrument: InstrumentId::new(raw.class_code, raw.sec_code),
                    price,
                    volume: raw.qty.round() as i64,
                    ts,
                    seq: raw.trade_num,
                })
            }
            names::NEW_CANDLE => {
                let row: CandleRow = from_data(data).map_err(&fail)?;
                let series = row
                    .series()
                    .ok_or_else(|| fail("candle without class/sec/interval".to_string()))?;
                let bar = row.to_bar().map_err(&fail)?;
                BridgeEvent::Candle { series, bar }
            }
            names::TRADE => BridgeEvent::OwnTrade(from_data(data).map_err(&fail)?),
            names::ORDER => BridgeEvent::Order(from_data(data).map_err(&fail)?),
            names::STOP_ORDER => BridgeEvent::StopOrder(from_data(data).map_err(&fail)?),
            names::TRANS_REPLY => BridgeEvent::TransReply(from_data(data).map_err(&fail)?),
            names::CONNECTED => BridgeEvent::TerminalConnected,
            names::DISCONNECTED => BridgeEvent::TerminalDisconnected,
            _ => BridgeEvent::Other(name.clone()),
        };
        Ok(ev)
    }

    /// Market events go through the bounded, lossy-on-overflow queue; the rest
    /// must reach the reconciler.
    pub fn is_market(&self) -> bool {
        matches!(self, BridgeEvent::Tick(_) | BridgeEvent::Candle { .. })
    }

    /// Instrument a market event refers to.
    pub fn market_instrument(&self) -> Option<&InstrumentId> {
        match self {
            BridgeEvent::Tick(t) => Some(&t.instrument),
            BridgeEvent::Candle { series, .. } => Some(&series.instrument),
            _ => None,
        }
    }
}

fn from_data<T: for<'de> Deserialize<'de>>(data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(name: &str, data: Value) -> EventFrame {
        EventFrame {
            name: name.to_string(),
            data,
            t: None,
        }
    }

    fn dt() -> Value {
        json!({"year": 2024, "month": 3, "day": 1, "hour": 10, "min": 0, "sec": 30, "ms": 0})
    }

    #[test]
    fn all_trade_becomes_tick() {
        let ev = BridgeEvent::decode(frame(
            "OnAllTrade",
            json!({"trade_num": 900, "flags": 1, "price": "102.5", "qty": 3,
                   "class_code": "TQBR", "sec_code": "SBER", "datetime": dt()}),
        ))
        .unwrap();
        match ev {
            BridgeEvent::Tick(t) => {
                assert_eq!(t.instrument, InstrumentId::new("TQBR", "SBER"));
                assert_eq!(t.price, 102_500_000);
                assert_eq!(t.volume, 3);
                assert_eq!(t.seq, 900);
                assert_eq!(t.ts.to_string(), "2024-03-01 10:00:30");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn new_candle_carries_series() {
        let ev = BridgeEvent::decode(frame(
            "NewCandle",
            json!({"open": 1, "high": 2, "low": 0.5, "close": 1.5, "volume": 10,
                   "datetime": dt(), "sec": "SBER", "class": "TQBR", "interval": 5}),
        ))
        .unwrap();
        match ev {
            BridgeEvent::Candle { series, bar } => {
                assert_eq!(series.data_id(), "TQBR.SBER.M5");
                assert_eq!(bar.low, 500_000);
                assert_eq!(bar.volume, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn order_flags_decode() {
        let active = OrderRow {
            order_num: 1,
            trans_id: 2,
            flags: 0x1 | 0x4,
            price: 0.0,
            qty: 1,
            balance: 1,
            ext_order_status: 0,
            class_code: String::new(),
            sec_code: String::new(),
        };
        assert_eq!(active.state(), RowState::Active);
        assert_eq!(active.side(), Side::Sell);
        let canceled = OrderRow { flags: 0x2, ..active.clone() };
        assert_eq!(canceled.state(), RowState::Canceled);
        assert_eq!(canceled.side(), Side::Buy);
        let done = OrderRow { flags: 0, ..active };
        assert_eq!(done.state(), RowState::Completed);
    }

    #[test]
    fn own_trade_sums_fees() {
        let ev = BridgeEvent::decode(frame(
            "OnTrade",
            json!({"trade_num": 5, "order_num": 6, "trans_id": 7, "price": 50, "qty": 10,
                   "flags": 0, "class_code": "TQBR", "sec_code": "SBER", "datetime": dt(),
                   "exchange_comission": 0.25, "broker_comission": "0.5"}),
        ))
        .unwrap();
        let BridgeEvent::OwnTrade(t) = ev else {
            panic!("expected own trade")
        };
        assert_eq!(t.side(), Side::Buy);
        assert!((t.reported_commission() - 0.75).abs() < 1e-9);
        assert!(!BridgeEvent::OwnTrade(t).is_market());
    }

    #[test]
    fn unknown_and_bad_payloads() {
        assert_eq!(
            BridgeEvent::decode(frame("OnQuote", json!({}))).unwrap(),
            BridgeEvent::Other("OnQuote".into())
        );
        let err = BridgeEvent::decode(frame("OnAllTrade", json!({"price": "abc"}))).unwrap_err();
        assert!(matches!(err, DecodeError::Payload { .. }));
    }
}
