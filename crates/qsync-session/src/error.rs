use std::fmt;
use std::time::Duration;

/// Failure of a single command call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The session is not in `Connected`.
    NotConnected,
    /// No response within the command timeout.
    Timeout { cmd: String, after: Duration },
    /// The command never reached the bridge.
    Transport(String),
    /// The command was written but the connection dropped before the reply.
    /// The bridge may have executed it.
    Lost { cmd: String },
    /// The bridge answered with a script error.
    Remote { cmd: String, message: String },
    /// The response could not be used (id reuse, bad payload).
    Protocol(String),
}

impl CommandError {
    /// Transport-level failures heal with a reconnect; the rest do not.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CommandError::NotConnected | CommandError::Transport(_) | CommandError::Lost { .. }
        )
    }

    /// The bridge may have received the command even though the call failed.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, CommandError::Timeout { .. } | CommandError::Lost { .. })
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::NotConnected => write!(f, "session not connected"),
            CommandError::Timeout { cmd, after } => {
                write!(f, "{cmd} timed out after {}ms", after.as_millis())
            }
            CommandError::Transport(e) => write!(f, "transport failure: {e}"),
            CommandError::Lost { cmd } => write!(f, "{cmd} sent but the connection was lost before the reply"),
            CommandError::Remote { cmd, message } => write!(f, "{cmd} failed in bridge: {message}"),
            CommandError::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Failure to establish a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Connect(String),
    Handshake(String),
    /// Reconnect attempts exhausted; the session is dead until `reconnect()`.
    Exhausted { attempts: u32 },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Connect(e) => write!(f, "connect failed: {e}"),
            SessionError::Handshake(e) => write!(f, "handshake failed: {e}"),
            SessionError::Exhausted { attempts } => {
                write!(f, "gave up after {attempts} reconnect attempts")
            }
        }
    }
}

impl std::error::Error for SessionError {}
