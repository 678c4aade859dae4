//! qsync-protocol
//!
//! Wire codec for the connector bridge.
//!
//! Both sockets carry newline-delimited UTF-8 JSON. The command socket
//! carries request/response pairs correlated by a transaction id; the event
//! socket carries unsolicited pushes without an id.
//!
//! ```text
//! request   {"id":7,"cmd":"getSecurityInfo","data":"TQBR|SBER","t":1700000000000}
//! response  {"id":7,"cmd":"getSecurityInfo","data":{...},"t":...}
//! error     {"id":7,"cmd":"getSecurityInfo","lua_error":"...","t":...}
//! event     {"cmd":"OnAllTrade","data":{...},"t":...}
//! ```
//!
//! This crate owns framing, typed payloads, the pending-response table and
//! protocol counters. It performs no IO.

pub mod commands;
pub mod events;
pub mod frame;
pub mod pending;
pub mod wire;

pub use commands::Command;
pub use events::BridgeEvent;
pub use frame::{decode_line, encode_request, Channel, CommandResponse, DecodeError, EventFrame, Inbound};
pub use pending::{PendingTable, ProtocolCounters, ProtocolError, ProtocolStats, TransIdAllocator};
