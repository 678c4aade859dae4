//! Command constructors and typed response payloads.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use qsync_schemas::{InstrumentId, SeriesKey};

use crate::wire::{f64_lenient, i64_lenient};

/// One outgoing command. The session assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: &'static str,
    pub data: Value,
}

impl Command {
    fn new(name: &'static str, data: Value) -> Self {
        Self { name, data }
    }

    /// Handshake check; the bridge answers `"Pong"`.
    pub fn ping() -> Self {
        Self::new("ping", json!("Ping"))
    }

    pub fn is_connected() -> Self {
        Self::new("isConnected", json!(""))
    }

    pub fn security_info(id: &InstrumentId) -> Self {
        Self::new("getSecurityInfo", json!(id.wire_args()))
    }

    pub fn classes_list() -> Self {
        Self::new("getClassesList", json!(""))
    }

    /// Find which of `classes` (comma separated) lists `sec_code`.
    pub fn security_class(classes: &str, sec_code: &str) -> Self {
        Self::new("getSecurityClass", json!(format!("{classes}|{sec_code}")))
    }

    pub fn trade_accounts() -> Self {
        Self::new("getTradeAccounts", json!(""))
    }

    pub fn money_limits() -> Self {
        Self::new("getMoneyLimits", json!(""))
    }

    pub fn futures_limit(firm_id: &str, account: &str, currency: &str) -> Self {
        Self::new(
            "getFuturesLimit",
            json!(format!("{firm_id}|{account}|0|{currency}")),
        )
    }

    pub fn portfolio_info_ex(firm_id: &str, client_code: &str, limit_kind: i64) -> Self {
        Self::new(
            "getPortfolioInfoEx",
            json!(format!("{firm_id}|{client_code}|{limit_kind}")),
        )
    }

    pub fn depo_limits() -> Self {
        Self::new("get_depo_limits", json!(""))
    }

    pub fn futures_holdings() -> Self {
        Self::new("getFuturesClientHoldings", json!(""))
    }

    pub fn orders() -> Self {
        Self::new("get_orders", json!(""))
    }

    pub fn stop_orders() -> Self {
        Self::new("get_stop_orders", json!(""))
    }

    /// One current-parameter value (`LAST`, `STEPPRICE`, ...).
    pub fn param_ex(id: &InstrumentId, param: &str) -> Self {
        Self::new("getParamEx", json!(format!("{}|{param}", id.wire_args())))
    }

    /// Last trade price.
    pub fn last_price(id: &InstrumentId) -> Self {
        Self::param_ex(id, "LAST")
    }

    /// Currency value of one price step (futures).
    pub fn step_price(id: &InstrumentId) -> Self {
        Self::param_ex(id, "STEPPRICE")
    }

    /// `TRADEDATE`, `SERVERTIME`, ...
    pub fn info_param(name: &str) -> Self {
        Self::new("getInfoParam", json!(name))
    }

    /// One page of bars with open-time strictly before `to` (latest when `None`).
    pub fn candles(series: &SeriesKey, count: usize, to: Option<chrono::NaiveDateTime>) -> Self {
        let to = to.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string());
        Self::new(
            "get_candles_from_data_source",
            json!({
                "class_code": series.instrument.class_code,
                "sec_code": series.instrument.sec_code,
                "interval": series.timeframe.quik_code(),
                "count": count,
                "to": to,
            }),
        )
    }

    pub fn subscribe_candles(series: &SeriesKey) -> Self {
        Self::new("subscribe_to_candles", json!(candle_args(series)))
    }

    pub fn unsubscribe_candles(series: &SeriesKey) -> Self {
        Self::new("unsubscribe_from_candles", json!(candle_args(series)))
    }

    /// Submit a transaction. Every field value is sent as a string.
    pub fn send_transaction(fields: &BTreeMap<String, String>) -> Self {
        Self::new("sendTransaction", json!(fields))
    }
}

fn candle_args(series: &SeriesKey) -> String {
    format!(
        "{}|{}",
        series.instrument.wire_args(),
        series.timeframe.quik_code()
    )
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SecurityInfo {
    #[serde(deserialize_with = "i64_lenient", default)]
    pub lot_size: i64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub min_price_step: f64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub scale: i64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub face_value: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TradeAccount {
    /// Pipe-delimited class list, e.g. `|TQBR|SPBFUT|`.
    #[serde(default)]
    pub class_codes: String,
    #[serde(default)]
    pub firmid: String,
    #[serde(default)]
    pub trdaccid: String,
}

impl TradeAccount {
    pub fn trades_class(&self, class_code: &str) -> bool {
        self.class_codes.split('|').any(|c| c == class_code)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MoneyLimit {
    #[serde(default)]
    pub currcode: String,
    #[serde(default)]
    pub firmid: String,
    #[serde(default)]
    pub client_code: String,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub currentbal: f64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub limit_kind: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FuturesLimit {
    #[serde(deserialize_with = "f64_lenient", default)]
    pub cbplimit: f64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub varmargin: f64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub accruedint: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PortfolioInfoEx {
    #[serde(deserialize_with = "f64_lenient", default)]
    pub all_assets: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DepoLimit {
    #[serde(default)]
    pub sec_code: String,
    #[serde(default)]
    pub firmid: String,
    #[serde(default)]
    pub client_code: String,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub currentbal: i64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub wa_position_price: f64,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub limit_kind: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FuturesHolding {
    #[serde(default)]
    pub sec_code: String,
    #[serde(deserialize_with = "i64_lenient", default)]
    pub totalnet: i64,
    #[serde(deserialize_with = "f64_lenient", default)]
    pub avrposnprice: f64,
}

#[derive(Debug, Deserialize)]
struct ParamEx {
    #[serde(default)]
    param_value: Value,
}

/// Decode a response payload into `T`.
pub fn parse<T: for<'de> Deserialize<'de>>(data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|e| e.to_string())
}

/// Decode an array payload; `null` (empty terminal table) is an empty list.
pub fn parse_list<T: for<'de> Deserialize<'de>>(data: Value) -> Result<Vec<T>, String> {
    match data {
        Value::Null => Ok(Vec::new()),
        other => parse(other),
    }
}

/// `getParamEx` answer → the numeric value, `None` when empty or non-numeric.
pub fn parse_param_value(data: Value) -> Option<f64> {
    let p: ParamEx = serde_json::from_value(data).ok()?;
    match p.param_value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// `getClassesList` answer → class codes.
pub fn parse_classes(data: &Value) -> Vec<String> {
    data.as_str()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsync_schemas::Timeframe;

    #[test]
    fn candle_request_shape() {
        let key = SeriesKey::new(InstrumentId::new("TQBR", "SBER"), Timeframe::M5);
        let to = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let c = Command::candles(&key, 500, Some(to));
        assert_eq!(c.name, "get_candles_from_data_source");
        assert_eq!(c.data["interval"], 5);
        assert_eq!(c.data["count"], 500);
        assert_eq!(c.data["to"], "2024-03-01 10:00:00");
        assert!(Command::candles(&key, 1, None).data["to"].is_null());
        assert_eq!(Command::subscribe_candles(&key).data, "TQBR|SBER|5");
    }

    #[test]
    fn reference_commands_use_pipe_args() {
        let id = InstrumentId::new("SPBFUT", "SiZ4");
        assert_eq!(Command::security_info(&id).data, "SPBFUT|SiZ4");
        assert_eq!(Command::last_price(&id).data, "SPBFUT|SiZ4|LAST");
        assert_eq!(Command::step_price(&id).data, "SPBFUT|SiZ4|STEPPRICE");
        assert_eq!(
            Command::futures_limit("SPBFUT", "ACC1", "SUR").data,
            "SPBFUT|ACC1|0|SUR"
        );
        assert_eq!(Command::portfolio_info_ex("MC01", "C1", 2).data, "MC01|C1|2");
    }

    #[test]
    fn responses_decode_leniently() {
        let info: SecurityInfo =
            parse(serde_json::json!({"lot_size": "10", "min_price_step": 0.01, "scale": 2})).unwrap();
        assert_eq!(info.lot_size, 10);
        assert_eq!(info.scale, 2);

        let acc: TradeAccount =
            parse(serde_json::json!({"class_codes": "|TQBR|SPBFUT|", "firmid": "F", "trdaccid": "A"}))
                .unwrap();
        assert!(acc.trades_class("SPBFUT"));
        assert!(!acc.trades_class("SPB"));

        let empty: Vec<DepoLimit> = parse_list(Value::Null).unwrap();
        assert!(empty.is_empty());

        assert_eq!(parse_param_value(serde_json::json!({"param_value": "251.3"})), Some(251.3));
        assert_eq!(parse_param_value(serde_json::json!({"param_value": ""})), None);
        assert_eq!(parse_classes(&serde_json::json!("TQBR,SPBFUT,")), vec!["TQBR", "SPBFUT"]);
    }
}
