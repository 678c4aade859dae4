//! Trading account resolution, cash sources and the commission model.

use serde::{Deserialize, Serialize};

use qsync_config::AdapterConfig;
use qsync_protocol::commands::{FuturesLimit, MoneyLimit, PortfolioInfoEx, TradeAccount};
use qsync_schemas::{price_to_micros, Instrument};

use crate::position::{clamp_i64, mul_qty_price};

const FUTURES_CLASS: &str = "SPBFUT";

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Where cash comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CashMode {
    /// Unified cash position: `getPortfolioInfoEx.all_assets`.
    Edp,
    /// `cbplimit + varmargin + accruedint`.
    Futures,
    /// Money limit `currentbal` for the client/firm/limit kind/currency.
    MoneyLimit,
}

/// The resolved trading account orders are routed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRouting {
    pub trade_account_id: String,
    pub firm_id: String,
    pub client_code: String,
    /// `CLIENT_CODE` written into transactions.
    pub order_client_code: String,
    pub class_codes: Vec<String>,
    pub futures: bool,
    pub cash_mode: CashMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountError {
    NoMoneyLimits,
    NoAccounts,
    UnknownAccount(String),
}

impl std::fmt::Display for AccountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountError::NoMoneyLimits => write!(f, "terminal reported no money limits"),
            AccountError::NoAccounts => write!(f, "terminal reported no trade accounts"),
            AccountError::UnknownAccount(id) => write!(f, "trade account {id} not found"),
        }
    }
}

impl std::error::Error for AccountError {}

/// Pick the configured trade account (or the first one) and derive its
/// client code from the money limit of the same firm.
pub fn resolve_routing(
    cfg: &AdapterConfig,
    accounts: &[TradeAccount],
    money_limits: &[MoneyLimit],
) -> Result<AccountRouting, AccountError> {
    if money_limits.is_empty() {
        return Err(AccountError::NoMoneyLimits);
    }
    let account = match cfg.trade_account_id.as_deref() {
        Some(id) => accounts
            .iter()
            .find(|a| a.trdaccid == id)
            .ok_or_else(|| AccountError::UnknownAccount(id.to_string()))?,
        None => accounts.first().ok_or(AccountError::NoAccounts)?,
    };

    let client_code = money_limits
        .iter()
        .find(|m| m.firmid == account.firmid)
        .map(|m| m.client_code.clone())
        .unwrap_or_default();
    let class_codes: Vec<String> = account
        .class_codes
        .split('|')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    let futures = account.trades_class(FUTURES_CLASS) || account.firmid == cfg.futures_firm_id;
    let cash_mode = match (futures, cfg.edp) {
        (true, true) => CashMode::Edp,
        (true, false) => CashMode::Futures,
        (false, _) => CashMode::MoneyLimit,
    };

    Ok(AccountRouting {
        trade_account_id: account.trdaccid.clone(),
        firm_id: account.firmid.clone(),
        order_client_code: cfg
            .client_code_for_orders
            .clone()
            .unwrap_or_else(|| client_code.clone()),
        client_code,
        class_codes,
        futures,
        cash_mode,
    })
}

// ---------------------------------------------------------------------------
// Cash
// ---------------------------------------------------------------------------

/// Money-limit balance for the routed client. `None` when no row matches.
pub fn money_limit_cash(
    routing: &AccountRouting,
    cfg: &AdapterConfig,
    limits: &[MoneyLimit],
) -> Option<i64> {
    limits
        .iter()
        .find(|m| {
            m.client_code == routing.client_code
                && m.firmid == routing.firm_id
                && m.limit_kind == cfg.limit_kind
                && m.currcode == cfg.currency
        })
        .and_then(|m| price_to_micros(m.currentbal).ok())
}

pub fn futures_cash(limit: &FuturesLimit) -> Option<i64> {
    price_to_micros(limit.cbplimit + limit.varmargin + limit.accruedint).ok()
}

pub fn edp_cash(portfolio: &PortfolioInfoEx) -> Option<i64> {
    price_to_micros(portfolio.all_assets).ok()
}

// ---------------------------------------------------------------------------
// Commission
// ---------------------------------------------------------------------------

/// Fixed fee per lot plus a rate on notional. Used when the terminal does not
/// report fees on the fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommissionModel {
    pub per_lot_micros: i64,
    /// Basis points of notional.
    pub rate_bps_micros: i64,
}

impl CommissionModel {
    pub fn from_config(cfg: &AdapterConfig) -> Self {
        Self {
            per_lot_micros: price_to_micros(cfg.commission_per_lot).unwrap_or(0),
            rate_bps_micros: price_to_micros(cfg.commission_rate_bps).unwrap_or(0),
        }
    }

    /// Fee in micros for `qty` units at `price`. A positive terminal-reported
    /// fee wins over the model.
    pub fn fee(&self, instrument: &Instrument, qty: i64, price: i64, reported: f64) -> i64 {
        if reported > 0.0 {
            if let Ok(fee) = price_to_micros(reported) {
                return fee;
            }
        }
        let lots = if instrument.lot_size > 1 {
            qty / instrument.lot_size
        } else {
            qty
        };
        let fixed = mul_qty_price(lots, self.per_lot_micros);
        // notional(micros) * bps(micros) / (10_000 * 1_000_000)
        let variable = mul_qty_price(qty, price) * self.rate_bps_micros as i128 / 10_000_000_000;
        clamp_i64(fixed + variable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsync_schemas::InstrumentId;

    fn acc(id: &str, firm: &str, classes: &str) -> TradeAccount {
        TradeAccount {
            class_codes: classes.to_string(),
            firmid: firm.to_string(),
            trdaccid: id.to_string(),
        }
    }

    fn limit(client: &str, firm: &str, bal: f64) -> MoneyLimit {
        MoneyLimit {
            currcode: "SUR".to_string(),
            firmid: firm.to_string(),
            client_code: client.to_string(),
            currentbal: bal,
            limit_kind: 1,
        }
    }

    #[test]
    fn resolves_configured_account_and_client_code() {
        let mut cfg = AdapterConfig::default();
        cfg.trade_account_id = Some("L01".into());
        let accounts = [acc("F01", "SPBFUT", "|SPBFUT|"), acc("L01", "MC0002", "|TQBR|TQTF|")];
        let limits = [limit("C777", "MC0002", 1000.0)];

        let r = resolve_routing(&cfg, &accounts, &limits).unwrap();
        assert_eq!(r.trade_account_id, "L01");
        assert_eq!(r.client_code, "C777");
        assert_eq!(r.order_client_code, "C777");
        assert_eq!(r.class_codes, vec!["TQBR", "TQTF"]);
        assert!(!r.futures);
        assert_eq!(r.cash_mode, CashMode::MoneyLimit);
        assert_eq!(money_limit_cash(&r, &cfg, &limits), Some(1_000_000_000));
    }

    #[test]
    fn futures_account_uses_edp_when_enabled() {
        let mut cfg = AdapterConfig::default();
        cfg.edp = true;
        cfg.client_code_for_orders = Some("OVR".into());
        let r = resolve_routing(&cfg, &[acc("F01", "SPBFUT", "|SPBFUT|")], &[limit("C1", "SPBFUT", 0.0)])
            .unwrap();
        assert!(r.futures);
        assert_eq!(r.cash_mode, CashMode::Edp);
        assert_eq!(r.order_client_code, "OVR");
    }

    #[test]
    fn missing_limits_or_account_fail() {
        let cfg = AdapterConfig::default();
        assert_eq!(
            resolve_routing(&cfg, &[acc("L01", "F", "|TQBR|")], &[]),
            Err(AccountError::NoMoneyLimits)
        );
        let mut cfg = cfg;
        cfg.trade_account_id = Some("X".into());
        assert_eq!(
            resolve_routing(&cfg, &[acc("L01", "F", "|TQBR|")], &[limit("C", "F", 1.0)]),
            Err(AccountError::UnknownAccount("X".into()))
        );
    }

    #[test]
    fn futures_cash_sums_components() {
        let l = FuturesLimit {
            cbplimit: 100.0,
            varmargin: -5.5,
            accruedint: 0.5,
        };
        assert_eq!(futures_cash(&l), Some(95_000_000));
    }

    #[test]
    fn reported_fee_wins_over_model() {
        let inst = Instrument::new(InstrumentId::new("TQBR", "SBER"), 10, 10_000, 2);
        let model = CommissionModel {
            per_lot_micros: 1_000_000,
            rate_bps_micros: 5_000_000,
        };
        // 2 lots * 1.00 + 20 * 50.00 * 5bps = 2.00 + 0.50
        assert_eq!(model.fee(&inst, 20, 50_000_000, 0.0), 2_500_000);
        assert_eq!(model.fee(&inst, 20, 50_000_000, 0.37), 370_000);
    }
}
