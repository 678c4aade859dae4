//! Line framing: encode requests, decode inbound lines.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lines longer than this are dropped as malformed.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Which socket a line arrived on; decides how an id-less frame is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Command,
    Event,
}

// ---------------------------------------------------------------------------
// Decoded frames
// ---------------------------------------------------------------------------

/// Response to one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub id: u64,
    pub cmd: String,
    pub data: Value,
    /// Set when the bridge script failed to execute the command.
    pub lua_error: Option<String>,
}

/// An unsolicited push, not yet decoded into a typed event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub name: String,
    pub data: Value,
    /// Bridge-side send time (unix ms), when present.
    pub t: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(CommandResponse),
    Event(EventFrame),
    /// Blank keepalive line.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Oversize(usize),
    Json(String),
    MissingCmd,
    MissingId,
    Payload { event: String, reason: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Oversize(n) => write!(f, "frame of {n} bytes exceeds {MAX_FRAME_BYTES}"),
            DecodeError::Json(e) => write!(f, "frame is not valid json: {e}"),
            DecodeError::MissingCmd => write!(f, "frame has no cmd"),
            DecodeError::MissingId => write!(f, "command response has no id"),
            DecodeError::Payload { event, reason } => {
                write!(f, "payload of {event} could not be decoded: {reason}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ---------------------------------------------------------------------------
// Raw shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    id: u64,
    cmd: &'a str,
    data: &'a Value,
    t: i64,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    cmd: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    t: Option<i64>,
    #[serde(default)]
    lua_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serialize one request line, newline included.
pub fn encode_request(id: u64, cmd: &str, data: &Value, t_ms: i64) -> String {
    let frame = OutboundFrame {
        id,
        cmd,
        data,
        t: t_ms,
    };
    // Serializing a struct of plain fields and a `Value` cannot fail.
    let mut line = serde_json::to_string(&frame).unwrap_or_default();
    line.push('\n');
    line
}

/// Decode one inbound line.
pub fn decode_line(line: &str, channel: Channel) -> Result<Inbound, DecodeError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::Oversize(line.len()));
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Inbound::Empty);
    }

    let raw: RawFrame =
        serde_json::from_str(trimmed).map_err(|e| DecodeError::Json(e.to_string()))?;
    let cmd = raw.cmd.ok_or(DecodeError::MissingCmd)?;

    match channel {
        Channel::Command => {
            let id = raw.id.ok_or(DecodeError::MissingId)?;
            Ok(Inbound::Response(CommandResponse {
                id,
                cmd,
                data: raw.data,
                lua_error: raw.lua_error.filter(|e| !e.is_empty()),
            }))
        }
        Channel::Event => Ok(Inbound::Event(EventFrame {
            name: cmd,
            data: raw.data,
            t: raw.t,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_is_one_json_line() {
        let line = encode_request(7, "getSecurityInfo", &json!("TQBR|SBER"), 1_700_000_000_000);
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let v: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["cmd"], "getSecurityInfo");
        assert_eq!(v["data"], "TQBR|SBER");
    }

    #[test]
    fn response_carries_id_and_error() {
        let ok = decode_line(r#"{"id":3,"cmd":"ping","data":"Pong","t":1}"#, Channel::Command).unwrap();
        assert_eq!(
            ok,
            Inbound::Response(CommandResponse {
                id: 3,
                cmd: "ping".into(),
                data: json!("Pong"),
                lua_error: None
            })
        );

        let err = decode_line(
            r#"{"id":4,"cmd":"getSecurityInfo","lua_error":"no such security","t":1}"#,
            Channel::Command,
        )
        .unwrap();
        match err {
            Inbound::Response(r) => assert_eq!(r.lua_error.as_deref(), Some("no such security")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn event_frames_need_no_id() {
        let ev = decode_line(r#"{"cmd":"OnAllTrade","data":{"price":1},"t":5}"#, Channel::Event).unwrap();
        match ev {
            Inbound::Event(e) => {
                assert_eq!(e.name, "OnAllTrade");
                assert_eq!(e.t, Some(5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_are_classified() {
        assert!(matches!(decode_line("{not json", Channel::Event), Err(DecodeError::Json(_))));
        assert_eq!(decode_line(r#"{"id":1}"#, Channel::Command), Err(DecodeError::MissingCmd));
        assert_eq!(decode_line(r#"{"cmd":"ping"}"#, Channel::Command), Err(DecodeError::MissingId));
        let huge = "x".repeat(MAX_FRAME_BYTES + 1);
        assert!(matches!(decode_line(&huge, Channel::Event), Err(DecodeError::Oversize(_))));
        assert_eq!(decode_line("  \r", Channel::Event), Ok(Inbound::Empty));
    }
}
