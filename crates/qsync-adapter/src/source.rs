//! Candle pages served by the bridge, and history fetches that survive a
//! dropped session.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tracing::{info, warn};

use qsync_md::{fetch_history, CandleSource, HistoryError, HistoryRequest};
use qsync_protocol::commands;
use qsync_protocol::events::CandleRow;
use qsync_protocol::Command;
use qsync_schemas::{Bar, SeriesKey};
use qsync_session::{CommandError, SessionManager};

/// `get_candles_from_data_source` over a live session.
#[derive(Clone)]
pub struct SessionCandleSource {
    session: SessionManager,
}

impl SessionCandleSource {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }
}

fn history_error(e: CommandError) -> HistoryError {
    match e {
        CommandError::NotConnected
        | CommandError::Transport(_)
        | CommandError::Lost { .. }
        | CommandError::Timeout { .. } => {
            HistoryError::Transport(e.to_string())
        }
        CommandError::Remote { .. } => HistoryError::Remote(e.to_string()),
        CommandError::Protocol(msg) => HistoryError::Decode(msg),
    }
}

#[async_trait]
impl CandleSource for SessionCandleSource {
    async fn fetch_page(
        &self,
        series: &SeriesKey,
        count: usize,
        to: Option<NaiveDateTime>,
    ) -> Result<Vec<Bar>, HistoryError> {
        let data = self
            .session
            .call(Command::candles(series, count, to))
            .await
            .map_err(history_error)?;
        let rows: Vec<CandleRow> = commands::parse_list(data).map_err(HistoryError::Decode)?;
        let mut bars = rows
            .iter()
            .map(CandleRow::to_bar)
            .collect::<Result<Vec<_>, _>>()
            .map_err(HistoryError::Decode)?;
        bars.sort_by_key(|b| b.open_time);
        Ok(bars)
    }
}

/// Pause before waiting on the session again, so a failure the supervisor
/// has not noticed yet does not spin.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Run `req`, reissuing the whole fetch after a transport failure once the
/// session is back. Gives up after `max_attempts` failures or when the
/// session is dead.
pub async fn fetch_with_retry(
    session: &SessionManager,
    source: &dyn CandleSource,
    req: &HistoryRequest,
    max_attempts: u32,
) -> Result<Vec<Bar>, HistoryError> {
    let mut attempts = 0u32;
    loop {
        match fetch_history(source, req).await {
            Ok(bars) => return Ok(bars),
            Err(e) if e.is_retryable() && attempts < max_attempts => {
                attempts += 1;
                warn!(series = %req.series, attempts, error = %e, "history fetch interrupted, waiting for session");
                tokio::time::sleep(RETRY_PAUSE).await;
                let generation = session
                    .wait_connected()
                    .await
                    .map_err(|e| HistoryError::Transport(e.to_string()))?;
                info!(series = %req.series, generation, "reissuing history fetch");
            }
            Err(e) => return Err(e),
        }
    }
}
