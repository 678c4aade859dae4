//! `qsync account`.

use anyhow::{Context, Result};

use qsync_schemas::micros_to_price;

/// Execute `qsync account`: sync with the terminal and print the book.
pub async fn account(config_paths: &[String]) -> Result<()> {
    let adapter = super::connect(config_paths).await?;

    adapter.wait_ready().await?;

    let routing = adapter
        .routing()
        .context("no trade account resolved; see log for the account sync error")?;
    println!(
        "account={} firm={} client={} cash_mode={:?}",
        routing.trade_account_id, routing.firm_id, routing.client_code, routing.cash_mode
    );
    println!("cash={}", micros_to_price(adapter.cash()));
    println!("equity={}", micros_to_price(adapter.equity()));

    for p in adapter.positions() {
        println!(
            "position instrument={} size={} avg_price={}",
            p.instrument,
            p.size,
            micros_to_price(p.avg_price)
        );
    }

    for o in adapter.orders().iter().filter(|o| o.status.is_live()) {
        println!(
            "order ref={} instrument={} side={:?} type={:?} size={} filled={} price={} status={:?}",
            o.order_ref,
            o.instrument,
            o.side,
            o.order_type,
            o.size,
            o.filled,
            o.price.map(micros_to_price).unwrap_or(0.0),
            o.status
        );
    }

    adapter.shutdown().await
}
