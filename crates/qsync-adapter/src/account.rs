//! Account routing, cash refresh, startup positions and order resync.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use qsync_protocol::commands::{
    self, DepoLimit, FuturesHolding, FuturesLimit, MoneyLimit, PortfolioInfoEx, TradeAccount,
};
use qsync_protocol::events::{OrderRow, StopOrderRow};
use qsync_protocol::Command;
use qsync_reconcile::account::{edp_cash, futures_cash, money_limit_cash};
use qsync_reconcile::{resolve_routing, AccountRouting, CashMode, Position, RestoreReport};
use qsync_schemas::{price_to_micros, Instrument, InstrumentId};

use crate::adapter::Shared;
use crate::broker::FUTURES_CLASS;

async fn query<T: DeserializeOwned>(shared: &Shared, cmd: Command) -> Result<T> {
    let name = cmd.name;
    let data = shared
        .session
        .call(cmd)
        .await
        .with_context(|| format!("{name} failed"))?;
    commands::parse(data)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("{name}: bad payload"))
}

async fn query_list<T: DeserializeOwned>(shared: &Shared, cmd: Command) -> Result<Vec<T>> {
    let name = cmd.name;
    let data = shared
        .session
        .call(cmd)
        .await
        .with_context(|| format!("{name} failed"))?;
    commands::parse_list(data)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("{name}: bad payload"))
}

/// Resolve and store the trade account orders are routed to.
pub(crate) async fn sync_account(shared: &Shared) -> Result<AccountRouting> {
    let accounts: Vec<TradeAccount> = query_list(shared, Command::trade_accounts()).await?;
    let limits: Vec<MoneyLimit> = query_list(shared, Command::money_limits()).await?;
    let routing = resolve_routing(&shared.cfg, &accounts, &limits)?;
    info!(
        account = %routing.trade_account_id,
        firm = %routing.firm_id,
        client = %routing.client_code,
        futures = routing.futures,
        cash_mode = ?routing.cash_mode,
        "trading account resolved"
    );
    shared.set_routing(routing.clone());
    Ok(routing)
}

/// Cash as the terminal reports it for the routed account.
pub(crate) async fn fetch_cash(shared: &Shared, routing: &AccountRouting) -> Result<i64> {
    let cfg = &shared.cfg;
    let cash = match routing.cash_mode {
        CashMode::Edp => {
            let p: PortfolioInfoEx = query(
                shared,
                Command::portfolio_info_ex(&routing.firm_id, &routing.client_code, cfg.limit_kind),
            )
            .await?;
            edp_cash(&p)
        }
        CashMode::Futures => {
            let l: FuturesLimit = query(
                shared,
                Command::futures_limit(&routing.firm_id, &routing.trade_account_id, &cfg.currency),
            )
            .await?;
            futures_cash(&l)
        }
        CashMode::MoneyLimit => {
            let limits: Vec<MoneyLimit> = query_list(shared, Command::money_limits()).await?;
            money_limit_cash(routing, cfg, &limits)
        }
    };
    cash.with_context(|| format!("no {:?} cash row for account {}", routing.cash_mode, routing.trade_account_id))
}

/// Replace local cash with the terminal balance.
pub(crate) async fn refresh_cash(shared: &Shared) -> Result<i64> {
    let routing = shared.routing().context("trading account not resolved")?;
    let cash = fetch_cash(shared, &routing).await?;
    shared.trading.set_cash(cash).await;
    Ok(cash)
}

/// Reference data for a held instrument, registered with the reconciler so
/// fills and equity convert its quotes to currency.
async fn held_instrument(shared: &Shared, id: &InstrumentId) -> Result<Instrument> {
    let inst = shared.instruments.instrument(&shared.session, id).await?;
    shared.trading.register_instrument(inst.clone()).await;
    Ok(inst)
}

/// Positions open on the terminal at startup, in units. Average prices stay
/// in terminal quote units.
pub(crate) async fn baseline_positions(shared: &Shared, routing: &AccountRouting) -> Result<Vec<Position>> {
    let mut out = Vec::new();
    if routing.futures {
        let rows: Vec<FuturesHolding> = query_list(shared, Command::futures_holdings()).await?;
        for row in rows.into_iter().filter(|r| r.totalnet != 0 && !r.sec_code.is_empty()) {
            let id = InstrumentId::new(FUTURES_CLASS, row.sec_code.as_str());
            let inst = match held_instrument(shared, &id).await {
                Ok(inst) => inst,
                Err(e) => {
                    warn!(instrument = %id, error = %format!("{e:#}"), "holding skipped");
                    continue;
                }
            };
            let size = if shared.cfg.lots {
                inst.lots_to_size(row.totalnet)
            } else {
                row.totalnet
            };
            let avg = price_to_micros(row.avrposnprice).unwrap_or(0);
            out.push(Position::baseline(id, size, avg));
        }
        return Ok(out);
    }

    let rows: Vec<DepoLimit> = query_list(shared, Command::depo_limits()).await?;
    let cfg = &shared.cfg;
    let mine = rows.into_iter().filter(|r| {
        r.currentbal != 0
            && r.client_code == routing.client_code
            && r.firmid == routing.firm_id
            && r.limit_kind == cfg.limit_kind
    });
    for row in mine {
        let id = match shared.instruments.resolve_ticker(&shared.session, &row.sec_code).await {
            Ok(id) => id,
            Err(e) => {
                warn!(sec_code = %row.sec_code, error = %format!("{e:#}"), "depo position skipped");
                continue;
            }
        };
        if let Err(e) = held_instrument(shared, &id).await {
            warn!(instrument = %id, error = %format!("{e:#}"), "no reference data, position valued at its quote");
        }
        let avg = price_to_micros(row.wa_position_price).unwrap_or(0);
        out.push(Position::baseline(id, row.currentbal, avg));
    }
    Ok(out)
}

/// Match restored live orders against the terminal's order tables.
pub(crate) async fn resync(shared: &Shared) -> Result<RestoreReport> {
    let requested_at = Utc::now();
    let orders: Vec<OrderRow> = query_list(shared, Command::orders()).await?;
    let stops: Vec<StopOrderRow> = query_list(shared, Command::stop_orders()).await?;
    let report = shared.trading.resync(orders, stops, requested_at).await?;
    info!(
        matched = report.matched,
        expired = report.expired,
        changed = report.changed,
        unconfirmed = report.unconfirmed,
        "live orders resynced"
    );
    Ok(report)
}
