//! Market-data commands: `qsync history` and `qsync watch`.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tracing::info;

use qsync_adapter::{FeedItem, FeedOptions, FeedStatus};
use qsync_schemas::micros_to_price;
use qsync_store::write_csv;

/// Execute `qsync history`: backfill once and print (or write) cache CSV.
pub async fn history(
    config_paths: &[String],
    ticker: &str,
    tf: &str,
    count: Option<usize>,
    csv: Option<PathBuf>,
) -> Result<()> {
    let adapter = super::connect(config_paths).await?;
    let series = super::series(&adapter, ticker, tf).await?;
    let count = count.unwrap_or(adapter.config().count);

    let bars = adapter.history(&series, count).await?;
    info!(series = %series, bars = bars.len(), "history fetched");

    match csv {
        Some(path) => {
            let file = File::create(&path)
                .with_context(|| format!("create csv failed: {}", path.display()))?;
            write_csv(BufWriter::new(file), &bars)
                .with_context(|| format!("write csv failed: {}", path.display()))?;
            println!(
                "history_ok=true series={} bars={} path={}",
                series.data_id(),
                bars.len(),
                path.display()
            );
        }
        None => write_csv(std::io::stdout().lock(), &bars).context("write csv to stdout failed")?,
    }

    adapter.shutdown().await
}

/// Execute `qsync watch`: backfill, then stream live bars until Ctrl-C or
/// the session dies. Writes a snapshot on the way out.
pub async fn watch(config_paths: &[String], ticker: &str, tf: &str) -> Result<()> {
    let adapter = super::connect(config_paths).await?;
    let series = super::series(&adapter, ticker, tf).await?;

    let opts = FeedOptions {
        live_bars: true,
        ..FeedOptions::from_config(adapter.config())
    };
    let mut feed = adapter.subscribe(series.clone(), opts).await?.into_stream();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut bars = 0usize;
    loop {
        tokio::select! {
            item = feed.next() => match item {
                Some(FeedItem::Bar(bar)) => {
                    bars += 1;
                    info!(
                        series = %series,
                        open_time = %bar.open_time,
                        open = micros_to_price(bar.open),
                        high = micros_to_price(bar.high),
                        low = micros_to_price(bar.low),
                        close = micros_to_price(bar.close),
                        volume = bar.volume,
                        "bar"
                    );
                }
                Some(FeedItem::Status(status)) => {
                    info!(series = %series, status = ?status, "feed status");
                    if status == FeedStatus::Disconnected {
                        break;
                    }
                }
                None => break,
            },
            res = &mut ctrl_c => {
                res.context("ctrl-c handler failed")?;
                info!("interrupted");
                break;
            }
        }
    }

    adapter.shutdown().await?;
    println!("watch_done=true series={} bars={}", series.data_id(), bars);
    Ok(())
}
