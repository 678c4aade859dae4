//! qsync-session
//!
//! Connection manager for the bridge: two TCP sessions (command and event),
//! the handshake, jittered exponential reconnect and the hand-off of decoded
//! events to their consumers.
//!
//! A [`SessionManager`] is a value owned by one adapter instance; several
//! independent adapters can run side by side in one process.

pub mod backoff;
pub mod error;
pub mod manager;

pub use backoff::{Backoff, BackoffConfig, ConnectionGap};
pub use error::{CommandError, SessionError};
pub use manager::{SessionConfig, SessionEvents, SessionManager, SessionState, SessionStatus};
