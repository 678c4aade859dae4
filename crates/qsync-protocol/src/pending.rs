//! Command/response correlation.
//!
//! [`PendingTable`] maps a command id to the one-shot slot its caller awaits.
//! The table is not synchronized; the session holds it under a mutex shared
//! by the command reader (resolves) and callers (register/expire their own
//! slot).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

use crate::frame::DecodeError;

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A command was registered under an id that is still pending.
    IdInUse(u64),
    /// A response arrived for an id with no pending slot.
    Unmatched { id: u64, cmd: String },
    /// A frame could not be decoded.
    Malformed(DecodeError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::IdInUse(id) => write!(f, "command id {id} reused while pending"),
            ProtocolError::Unmatched { id, cmd } => {
                write!(f, "response id={id} cmd={cmd} matches no pending command")
            }
            ProtocolError::Malformed(e) => write!(f, "malformed frame: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ---------------------------------------------------------------------------
// PendingTable
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PendingTable<T> {
    slots: HashMap<u64, oneshot::Sender<T>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `id`. An id already pending is refused and the existing
    /// slot is left untouched.
    pub fn register(&mut self, id: u64) -> Result<oneshot::Receiver<T>, ProtocolError> {
        if self.slots.contains_key(&id) {
            return Err(ProtocolError::IdInUse(id));
        }
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, tx);
        Ok(rx)
    }

    /// Deliver a response. A response for an unknown id, or for a slot whose
    /// caller already gave up, is `Unmatched`.
    pub fn resolve(&mut self, id: u64, cmd: &str, value: T) -> Result<(), ProtocolError> {
        let unmatched = || ProtocolError::Unmatched {
            id,
            cmd: cmd.to_string(),
        };
        let tx = self.slots.remove(&id).ok_or_else(unmatched)?;
        tx.send(value).map_err(|_| unmatched())
    }

    /// Drop the slot for `id` (timeout on the caller side).
    pub fn cancel(&mut self, id: u64) -> bool {
        self.slots.remove(&id).is_some()
    }

    /// Close every slot; each waiting caller observes a closed channel.
    /// Returns how many commands were failed.
    pub fn fail_all(&mut self) -> usize {
        let n = self.slots.len();
        self.slots.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Live protocol counters, shared by both readers.
#[derive(Debug, Default)]
pub struct ProtocolStats {
    frames: AtomicU64,
    malformed: AtomicU64,
    unmatched: AtomicU64,
    id_reuse: AtomicU64,
}

/// Point-in-time copy of [`ProtocolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolCounters {
    pub frames: u64,
    pub malformed: u64,
    pub unmatched: u64,
    pub id_reuse: u64,
}

impl ProtocolStats {
    pub fn frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a protocol error under its kind.
    pub fn error(&self, err: &ProtocolError) {
        let c = match err {
            ProtocolError::IdInUse(_) => &self.id_reuse,
            ProtocolError::Unmatched { .. } => &self.unmatched,
            ProtocolError::Malformed(_) => &self.malformed,
        };
        c.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProtocolCounters {
        ProtocolCounters {
            frames: self.frames.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            id_reuse: self.id_reuse.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// TransIdAllocator
// ---------------------------------------------------------------------------

/// Order transaction ids: `now_ms % 100_000_000`, bumped until unused.
///
/// The terminal requires positive ids below 2^31; the modulus keeps them in
/// range and makes ids from consecutive sessions unlikely to collide.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransIdAllocator;

impl TransIdAllocator {
    pub const MODULUS: i64 = 100_000_000;

    pub fn next(&self, now_ms: i64, in_use: impl Fn(i64) -> bool) -> i64 {
        let mut id = now_ms.rem_euclid(Self::MODULUS);
        for _ in 0..Self::MODULUS {
            if id != 0 && !in_use(id) {
                return id;
            }
            id = (id + 1) % Self::MODULUS;
        }
        // Every id in use; unreachable for any realistic order book.
        id.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_resolve() {
        let mut t: PendingTable<&'static str> = PendingTable::new();
        let rx = t.register(1).unwrap();
        t.resolve(1, "ping", "Pong").unwrap();
        assert_eq!(rx.await.unwrap(), "Pong");
        assert!(t.is_empty());
    }

    #[test]
    fn reuse_keeps_original_slot() {
        let mut t: PendingTable<u8> = PendingTable::new();
        let _rx = t.register(9).unwrap();
        assert_eq!(t.register(9).unwrap_err(), ProtocolError::IdInUse(9));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn unmatched_and_abandoned_responses() {
        let mut t: PendingTable<u8> = PendingTable::new();
        assert!(matches!(t.resolve(5, "x", 0), Err(ProtocolError::Unmatched { id: 5, .. })));

        let rx = t.register(6).unwrap();
        drop(rx);
        assert!(matches!(t.resolve(6, "x", 0), Err(ProtocolError::Unmatched { id: 6, .. })));
    }

    #[tokio::test]
    async fn fail_all_closes_waiters() {
        let mut t: PendingTable<u8> = PendingTable::new();
        let a = t.register(1).unwrap();
        let b = t.register(2).unwrap();
        assert_eq!(t.fail_all(), 2);
        assert!(a.await.is_err());
        assert!(b.await.is_err());
    }

    #[test]
    fn stats_bucket_errors() {
        let s = ProtocolStats::default();
        s.frame();
        s.error(&ProtocolError::IdInUse(1));
        s.error(&ProtocolError::Malformed(DecodeError::MissingCmd));
        s.error(&ProtocolError::Unmatched { id: 1, cmd: "x".into() });
        assert_eq!(
            s.snapshot(),
            ProtocolCounters {
                frames: 1,
                malformed: 1,
                unmatched: 1,
                id_reuse: 1
            }
        );
    }

    #[test]
    fn trans_ids_skip_used_and_zero() {
        let a = TransIdAllocator;
        assert_eq!(a.next(1_700_000_012_345, |_| false), 12_345);
        assert_eq!(a.next(1_700_000_012_345, |id| id == 12_345), 12_346);
        assert_eq!(a.next(200_000_000, |_| false), 1);
        assert_eq!(a.next(TransIdAllocator::MODULUS - 1, |id| id == TransIdAllocator::MODULUS - 1), 1);
    }
}
