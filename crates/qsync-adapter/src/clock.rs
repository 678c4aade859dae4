//! Terminal clock.
//!
//! Bar completion is judged against the terminal's own clock, not the host's.
//! On every connect the adapter reads `TRADEDATE` and `SERVERTIME` and keeps
//! the offset to local exchange time; until then, or when the terminal has no
//! server time, local time in Moscow stands in.

use std::sync::Mutex;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Europe::Moscow;
use tracing::{debug, warn};

use qsync_protocol::Command;
use qsync_session::SessionManager;

/// Local wall clock in exchange time.
pub fn exchange_now() -> NaiveDateTime {
    Utc::now().with_timezone(&Moscow).naive_local()
}

/// `TRADEDATE` (`dd.mm.yyyy`) + `SERVERTIME` (`hh:mm:ss`).
pub fn parse_terminal_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    let d = NaiveDate::parse_from_str(date.trim(), "%d.%m.%Y").ok()?;
    let t = NaiveTime::parse_from_str(time.trim(), "%H:%M:%S").ok()?;
    Some(d.and_time(t))
}

#[derive(Debug, Default)]
pub struct TerminalClock {
    /// terminal time minus local exchange time.
    offset: Mutex<Option<Duration>>,
}

impl TerminalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> NaiveDateTime {
        exchange_now() + self.offset().unwrap_or_else(Duration::zero)
    }

    pub fn offset(&self) -> Option<Duration> {
        *self.offset.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_offset(&self, offset: Option<Duration>) {
        *self.offset.lock().unwrap_or_else(|p| p.into_inner()) = offset;
    }

    /// Re-read the terminal clock. Keeps the previous offset on failure.
    pub async fn sync(&self, session: &SessionManager) {
        let date = session.call(Command::info_param("TRADEDATE")).await;
        let time = session.call(Command::info_param("SERVERTIME")).await;
        let parsed = match (&date, &time) {
            (Ok(d), Ok(t)) => parse_terminal_time(d.as_str().unwrap_or_default(), t.as_str().unwrap_or_default()),
            _ => None,
        };
        match parsed {
            Some(terminal) => {
                let offset = terminal - exchange_now();
                debug!(offset_secs = offset.num_seconds(), "terminal clock synced");
                self.set_offset(Some(offset));
            }
            None => warn!("terminal time unavailable, using local exchange time"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_terminal_fields() {
        let t = parse_terminal_time("01.03.2024", " 10:15:30").unwrap();
        assert_eq!(t.to_string(), "2024-03-01 10:15:30");
        assert!(parse_terminal_time("01.03.2024", "").is_none());
        assert!(parse_terminal_time("2024-03-01", "10:15:30").is_none());
    }

    #[test]
    fn offset_shifts_now() {
        let clock = TerminalClock::new();
        clock.set_offset(Some(Duration::hours(-1)));
        let diff = exchange_now() - clock.now();
        assert!((diff - Duration::hours(1)).num_seconds().abs() <= 1);
    }
}
