//! Signed positions with a weighted-average entry price.
//!
//! Rules for a fill of `qty` (positive) on `side`:
//! - same direction (or flat): average = (|size|·avg + qty·price) / (|size| + qty)
//! - opposite direction: closes up to |size| at the fill price, realizing
//!   `(price - avg) · closed · sign(size)`; any remainder opens a fresh
//!   position at the fill price
//!
//! All money math in i128, clamped back to i64 micros.

use serde::{Deserialize, Serialize};

use qsync_schemas::{InstrumentId, Side};

pub(crate) fn mul_qty_price(qty: i64, price_micros: i64) -> i128 {
    (qty as i128) * (price_micros as i128)
}

pub(crate) fn clamp_i64(x: i128) -> i64 {
    x.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: InstrumentId,
    /// Units; positive long, negative short.
    pub size: i64,
    /// Average entry price in micros, in terminal quote units; 0 when flat.
    pub avg_price: i64,
    pub realized_pnl: i64,
}

impl Position {
    pub fn flat(instrument: InstrumentId) -> Self {
        Self {
            instrument,
            size: 0,
            avg_price: 0,
            realized_pnl: 0,
        }
    }

    /// Baseline reported by the terminal at startup.
    pub fn baseline(instrument: InstrumentId, size: i64, avg_price: i64) -> Self {
        Self {
            instrument,
            size,
            avg_price: if size == 0 { 0 } else { avg_price },
            realized_pnl: 0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.size == 0
    }

    /// Fold one fill in. Returns the pnl realized by this fill.
    pub fn apply_fill(&mut self, side: Side, qty: i64, price: i64) -> i64 {
        if qty <= 0 {
            return 0;
        }
        let signed = side.sign() * qty;

        if self.size == 0 || self.size.signum() == signed.signum() {
            let held = self.size.abs();
            let total = held + qty;
            let avg = (mul_qty_price(held, self.avg_price) + mul_qty_price(qty, price))
                / total as i128;
            self.avg_price = clamp_i64(avg);
            self.size += signed;
            return 0;
        }

        let closed = qty.min(self.size.abs());
        let per_unit = (price as i128 - self.avg_price as i128) * self.size.signum() as i128;
        let realized = clamp_i64(per_unit * closed as i128);
        self.realized_pnl = self.realized_pnl.saturating_add(realized);

        self.size += signed;
        if self.size == 0 {
            self.avg_price = 0;
        } else if self.size.signum() == signed.signum() {
            // Flipped through flat: the remainder opened at the fill price.
            self.avg_price = price;
        }
        realized
    }

    /// Mark-to-market value at `price` (average price when `None`).
    pub fn market_value(&self, price: Option<i64>) -> i64 {
        clamp_i64(mul_qty_price(self.size, price.unwrap_or(self.avg_price)))
    }
}
