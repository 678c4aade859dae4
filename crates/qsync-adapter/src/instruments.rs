//! Instrument resolution and the process-lifetime reference-data cache.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use qsync_protocol::commands::{self, SecurityInfo};
use qsync_protocol::Command;
use qsync_schemas::{price_to_micros, Instrument, InstrumentId};
use qsync_session::SessionManager;

use crate::broker::FUTURES_CLASS;

/// Reference data → [`Instrument`]. Degenerate lot sizes and steps are
/// clamped to 1 so size and price arithmetic stays total.
pub fn instrument_from_info(id: InstrumentId, info: &SecurityInfo) -> Result<Instrument> {
    let tick = price_to_micros(info.min_price_step)
        .with_context(|| format!("{id}: bad min_price_step {}", info.min_price_step))?;
    let face_value = price_to_micros(info.face_value).unwrap_or(0).max(0);
    Ok(Instrument {
        face_value_micros: face_value,
        ..Instrument::new(
            id,
            info.lot_size.max(1),
            tick.max(1),
            u32::try_from(info.scale.clamp(0, 6)).unwrap_or(0),
        )
    })
}

#[derive(Debug, Default)]
pub struct InstrumentCache {
    instruments: Mutex<BTreeMap<InstrumentId, Instrument>>,
    /// Bare ticker → class code.
    classes: Mutex<BTreeMap<String, String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl InstrumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &InstrumentId) -> Option<Instrument> {
        lock(&self.instruments).get(id).cloned()
    }

    pub fn insert(&self, instrument: Instrument) {
        lock(&self.instruments).insert(instrument.id.clone(), instrument);
    }

    /// `CLASS.SEC`, or a bare `SEC` whose class the terminal is asked for.
    pub async fn resolve_ticker(&self, session: &SessionManager, ticker: &str) -> Result<InstrumentId> {
        if let Some(id) = InstrumentId::parse(ticker) {
            return Ok(id);
        }
        let sec = ticker.trim();
        if sec.is_empty() {
            bail!("empty ticker");
        }
        if let Some(class) = lock(&self.classes).get(sec).cloned() {
            return Ok(InstrumentId::new(class, sec));
        }

        let classes = session
            .call(Command::classes_list())
            .await
            .context("getClassesList failed")?;
        let classes = commands::parse_classes(&classes).join(",");
        let class = session
            .call(Command::security_class(&classes, sec))
            .await
            .with_context(|| format!("getSecurityClass failed for {sec}"))?;
        let class = match class {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => bail!("no class lists ticker {sec}"),
        };
        info!(sec_code = sec, class_code = %class, "ticker class resolved");
        lock(&self.classes).insert(sec.to_string(), class.clone());
        Ok(InstrumentId::new(class, sec))
    }

    /// Cached instrument, or `getSecurityInfo` on first use.
    pub async fn instrument(&self, session: &SessionManager, id: &InstrumentId) -> Result<Instrument> {
        if let Some(inst) = self.get(id) {
            return Ok(inst);
        }
        let data = session
            .call(Command::security_info(id))
            .await
            .with_context(|| format!("getSecurityInfo failed for {id}"))?;
        if data.is_null() {
            bail!("unknown instrument {id}");
        }
        let info: SecurityInfo = commands::parse(data).map_err(anyhow::Error::msg)?;
        let mut inst = instrument_from_info(id.clone(), &info)?;
        if id.class_code == FUTURES_CLASS {
            inst.step_price_micros = step_price(session, id).await;
        }
        info!(
            instrument = %id,
            lot_size = inst.lot_size,
            tick = inst.tick_size_micros,
            scale = inst.scale,
            face_value = inst.face_value_micros,
            step_price = inst.step_price_micros,
            "instrument resolved"
        );
        self.insert(inst.clone());
        Ok(inst)
    }
}

/// `STEPPRICE` in micros; 0 when the terminal has none. Read once per
/// resolution; the cache lives as long as the process.
async fn step_price(session: &SessionManager, id: &InstrumentId) -> i64 {
    match session.call(Command::step_price(id)).await {
        Ok(data) => commands::parse_param_value(data)
            .filter(|p| *p > 0.0)
            .and_then(|p| price_to_micros(p).ok())
            .unwrap_or(0),
        Err(e) => {
            warn!(instrument = %id, error = %e, "step price query failed");
            0
        }
    }
}
