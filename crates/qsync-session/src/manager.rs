//! Session manager.
//!
//! Owns the command and event sockets and their lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Connected
//!                     ^                            |
//!                     +------- Reconnecting <------+
//! ```
//!
//! One reader task per socket. The command reader only resolves pending
//! slots; the event reader decodes events and hands them off, starting only
//! once the session is `Connected`. Market events
//! go through a bounded queue with `try_send` so a slow consumer never stalls
//! the reader; on overflow the instrument is flagged for a gap re-fetch.
//! Trading events are never dropped.

use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use qsync_config::AdapterConfig;
use qsync_protocol::frame::MAX_FRAME_BYTES;
use qsync_protocol::{
    decode_line, encode_request, BridgeEvent, Channel, Command, CommandResponse, DecodeError,
    Inbound, PendingTable, ProtocolCounters, ProtocolError, ProtocolStats,
};
use qsync_schemas::InstrumentId;

use crate::backoff::{Backoff, BackoffConfig, ConnectionGap};
use crate::error::{CommandError, SessionError};

// ---------------------------------------------------------------------------
// Config / status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub command_port: u16,
    pub event_port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub backoff: BackoffConfig,
    pub event_queue_capacity: usize,
}

impl SessionConfig {
    pub fn from_adapter(cfg: &AdapterConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            command_port: cfg.port,
            event_port: cfg.event_port(),
            connect_timeout: cfg.connect_timeout(),
            command_timeout: cfg.command_timeout(),
            backoff: BackoffConfig {
                initial: Duration::from_millis(cfg.initial_backoff_ms),
                max: Duration::from_millis(cfg.max_backoff_ms),
                multiplier: cfg.backoff_multiplier,
                max_attempts: cfg.max_reconnect_attempts,
            },
            event_queue_capacity: cfg.event_queue_capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Bumped on every successful connect; a change means "reconnected".
    pub generation: u64,
    /// Consecutive failed attempts in the current outage.
    pub attempts: u32,
    /// Reconnect budget exhausted; nothing happens until `reconnect()`.
    pub fatal: bool,
    pub last_error: Option<String>,
}

impl SessionStatus {
    fn initial() -> Self {
        Self {
            state: SessionState::Disconnected,
            generation: 0,
            attempts: 0,
            fatal: false,
            last_error: None,
        }
    }
}

/// Receiving ends of the event hand-off queues.
#[derive(Debug)]
pub struct SessionEvents {
    /// Ticks and candles. Bounded; overflow flags a gap instead of blocking.
    pub market: mpsc::Receiver<BridgeEvent>,
    /// Orders, fills, transaction replies, terminal connectivity.
    pub trading: mpsc::Receiver<BridgeEvent>,
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Handle to one adapter's bridge session. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: SessionConfig,
    pending: Mutex<PendingTable<CommandResponse>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    next_id: AtomicU64,
    stats: ProtocolStats,
    status: watch::Sender<SessionStatus>,
    market_tx: mpsc::Sender<BridgeEvent>,
    trading_tx: mpsc::Sender<BridgeEvent>,
    overflowed: Mutex<BTreeSet<InstrumentId>>,
    gaps: Mutex<Vec<ConnectionGap>>,
    control: Notify,
    shutdown: AtomicBool,
}

impl SessionManager {
    /// Spawn the supervisor and return the handle plus the event queues.
    /// Must be called from inside a tokio runtime.
    pub fn start(cfg: SessionConfig) -> (Self, SessionEvents) {
        let capacity = cfg.event_queue_capacity.max(1);
        let (market_tx, market) = mpsc::channel(capacity);
        let (trading_tx, trading) = mpsc::channel(capacity);
        let (status, _) = watch::channel(SessionStatus::initial());

        let inner = Arc::new(Inner {
            cfg,
            pending: Mutex::new(PendingTable::new()),
            writer: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
            stats: ProtocolStats::default(),
            status,
            market_tx,
            trading_tx,
            overflowed: Mutex::new(BTreeSet::new()),
            gaps: Mutex::new(Vec::new()),
            control: Notify::new(),
            shutdown: AtomicBool::new(false),
        });

        tokio::spawn(supervise(Arc::clone(&inner)));
        (Self { inner }, SessionEvents { market, trading })
    }

    /// Send a command and wait (bounded) for its response payload.
    pub async fn call(&self, cmd: Command) -> Result<Value, CommandError> {
        if self.status().state != SessionState::Connected {
            return Err(CommandError::NotConnected);
        }
        self.inner.request(cmd).await
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status().state == SessionState::Connected
    }

    /// Wait until `Connected` and return its generation. Fails once the
    /// session is dead.
    pub async fn wait_connected(&self) -> Result<u64, SessionError> {
        let mut rx = self.inner.status.subscribe();
        loop {
            {
                let s = rx.borrow_and_update();
                if s.state == SessionState::Connected {
                    return Ok(s.generation);
                }
                if s.fatal {
                    return Err(SessionError::Exhausted {
                        attempts: s.attempts,
                    });
                }
            }
            if rx.changed().await.is_err() {
                return Err(SessionError::Connect("session stopped".to_string()));
            }
        }
    }

    /// Restart a dead session (or cut a backoff wait short).
    pub fn reconnect(&self) {
        info!("explicit reconnect requested");
        self.inner.control.notify_one();
    }

    /// Stop the supervisor and close both sockets.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.control.notify_one();
    }

    pub fn protocol_counters(&self) -> ProtocolCounters {
        self.inner.stats.snapshot()
    }

    pub fn has_overflow(&self) -> bool {
        !self.inner.overflowed().is_empty()
    }

    /// Instruments whose market events were dropped since the last call.
    pub fn take_overflowed(&self) -> BTreeSet<InstrumentId> {
        std::mem::take(&mut *self.inner.overflowed())
    }

    pub fn connection_gaps(&self) -> Vec<ConnectionGap> {
        lock(&self.inner.gaps).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Inner: commands and dispatch
// ---------------------------------------------------------------------------

impl Inner {
    fn pending(&self) -> MutexGuard<'_, PendingTable<CommandResponse>> {
        lock(&self.pending)
    }

    fn overflowed(&self) -> MutexGuard<'_, BTreeSet<InstrumentId>> {
        lock(&self.overflowed)
    }

    fn set_state(&self, state: SessionState, last_error: Option<String>, attempts: u32) {
        self.status.send_modify(|s| {
            if s.state != state {
                info!(from = ?s.state, to = ?state, "session state");
            }
            s.state = state;
            s.attempts = attempts;
            s.fatal = false;
            if last_error.is_some() {
                s.last_error = last_error;
            }
        });
    }

    fn mark_connected(&self) {
        self.status.send_modify(|s| {
            s.state = SessionState::Connected;
            s.generation += 1;
            s.attempts = 0;
            s.fatal = false;
            info!(generation = s.generation, "session connected");
        });
    }

    fn mark_fatal(&self, err: &SessionError, attempts: u32) {
        self.status.send_modify(|s| {
            s.state = SessionState::Disconnected;
            s.attempts = attempts;
            s.fatal = true;
            s.last_error = Some(err.to_string());
        });
    }

    async fn request(&self, cmd: Command) -> Result<Value, CommandError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = {
            let registered = self.pending().register(id);
            registered.map_err(|e| {
                self.stats.error(&e);
                warn!(error = %e, "command not sent");
                CommandError::Protocol(e.to_string())
            })?
        };

        let line = encode_request(id, cmd.name, &cmd.data, Utc::now().timestamp_millis());
        let written = {
            let mut w = self.writer.lock().await;
            match w.as_mut() {
                Some(w) => w.write_all(line.as_bytes()).await.map_err(|e| e.to_string()),
                None => Err("no command connection".to_string()),
            }
        };
        if let Err(e) = written {
            self.pending().cancel(id);
            return Err(CommandError::Transport(e));
        }

        match tokio::time::timeout(self.cfg.command_timeout, rx).await {
            Ok(Ok(resp)) => match resp.lua_error {
                Some(message) => Err(CommandError::Remote {
                    cmd: cmd.name.to_string(),
                    message,
                }),
                None => Ok(resp.data),
            },
            Ok(Err(_)) => Err(CommandError::Lost {
                cmd: cmd.name.to_string(),
            }),
            Err(_) => {
                self.pending().cancel(id);
                warn!(id, cmd = cmd.name, "command timed out");
                Err(CommandError::Timeout {
                    cmd: cmd.name.to_string(),
                    after: self.cfg.command_timeout,
                })
            }
        }
    }

    fn malformed(&self, e: DecodeError, socket: &'static str) {
        warn!(socket, error = %e, "malformed frame dropped");
        self.stats.error(&ProtocolError::Malformed(e));
    }

    fn on_command_line(&self, line: &str) {
        match decode_line(line, Channel::Command) {
            Ok(Inbound::Response(resp)) => {
                self.stats.frame();
                let (id, cmd) = (resp.id, resp.cmd.clone());
                let resolved = self.pending().resolve(id, &cmd, resp);
                if let Err(e) = resolved {
                    self.stats.error(&e);
                    warn!(error = %e, "response dropped");
                }
            }
            Ok(_) => {}
            Err(e) => self.malformed(e, "command"),
        }
    }

    async fn on_event_line(&self, line: &str) {
        let frame = match decode_line(line, Channel::Event) {
            Ok(Inbound::Event(frame)) => frame,
            Ok(_) => return,
            Err(e) => return self.malformed(e, "event"),
        };
        self.stats.frame();
        let ev = match BridgeEvent::decode(frame) {
            Ok(ev) => ev,
            Err(e) => return self.malformed(e, "event"),
        };

        if ev.is_market() {
            match self.market_tx.try_send(ev) {
                Ok(()) => {}
                Err(TrySendError::Full(ev)) => {
                    if let Some(id) = ev.market_instrument() {
                        if self.overflowed().insert(id.clone()) {
                            warn!(instrument = %id, "market queue full; flagged for gap re-fetch");
                        }
                    }
                }
                Err(TrySendError::Closed(_)) => {}
            }
            return;
        }
        if let BridgeEvent::Other(name) = &ev {
            debug!(event = %name, "event ignored");
            return;
        }
        // Trading events are applied in order and never dropped.
        let _ = self.trading_tx.send(ev).await;
    }

    async fn drop_connection(&self) {
        *self.writer.lock().await = None;
        let failed = self.pending().fail_all();
        if failed > 0 {
            warn!(failed, "outstanding commands failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Connection {
    readers: Vec<JoinHandle<()>>,
    lost_rx: mpsc::Receiver<String>,
}

impl Connection {
    fn abort(&self) {
        for r in &self.readers {
            r.abort();
        }
    }

    /// Wait for either reader to stop (or a shutdown request).
    async fn wait_lost(&mut self, inner: &Inner) -> String {
        loop {
            tokio::select! {
                reason = self.lost_rx.recv() => {
                    return reason.unwrap_or_else(|| "readers stopped".to_string());
                }
                _ = inner.control.notified() => {
                    if inner.shutdown.load(Ordering::SeqCst) {
                        return "shutdown".to_string();
                    }
                }
            }
        }
    }
}

async fn supervise(inner: Arc<Inner>) {
    let mut backoff = Backoff::new(inner.cfg.backoff.clone());
    let mut rng = StdRng::from_entropy();
    let mut outage: Option<(DateTime<Utc>, String)> = None;

    while !inner.shutdown.load(Ordering::SeqCst) {
        inner.set_state(SessionState::Connecting, None, backoff.attempts());

        match connect_once(&inner).await {
            Ok(mut conn) => {
                let attempts = backoff.attempts();
                backoff.reset();
                if let Some((since, reason)) = outage.take() {
                    let now = Utc::now();
                    let gap = ConnectionGap {
                        disconnect_ts: since,
                        reconnect_ts: now,
                        gap_ms: (now - since).num_milliseconds().max(0) as u64,
                        reason,
                        attempts,
                    };
                    info!(gap_ms = gap.gap_ms, attempts, "session restored");
                    lock(&inner.gaps).push(gap);
                }
                inner.mark_connected();

                let reason = conn.wait_lost(&inner).await;
                conn.abort();
                inner.drop_connection().await;
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                warn!(reason = %reason, "session lost");
                outage = Some((Utc::now(), reason.clone()));
                inner.set_state(SessionState::Reconnecting, Some(reason), 0);
            }
            Err(e) => {
                inner.drop_connection().await;
                warn!(error = %e, attempt = backoff.attempts() + 1, "session attempt failed");
                if outage.is_none() {
                    outage = Some((Utc::now(), e.to_string()));
                }
                inner.set_state(SessionState::Reconnecting, Some(e.to_string()), backoff.attempts());
            }
        }

        match backoff.next_delay(&mut rng) {
            Some(delay) => {
                warn!(
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.control.notified() => {}
                }
            }
            None => {
                let err = SessionError::Exhausted {
                    attempts: backoff.attempts(),
                };
                error!(error = %err, "session is dead until an explicit reconnect");
                inner.mark_fatal(&err, backoff.attempts());
                inner.control.notified().await;
                backoff.reset();
                outage = None;
            }
        }
    }

    inner.drop_connection().await;
    inner.set_state(SessionState::Disconnected, None, 0);
    info!("session supervisor stopped");
}

async fn connect_once(inner: &Arc<Inner>) -> Result<Connection, SessionError> {
    let cfg = &inner.cfg;
    let cmd_stream = connect(&cfg.host, cfg.command_port, cfg.connect_timeout).await?;
    let evt_stream = connect(&cfg.host, cfg.event_port, cfg.connect_timeout).await?;

    let (cmd_read, cmd_write) = cmd_stream.into_split();
    *inner.writer.lock().await = Some(cmd_write);

    let (lost_tx, lost_rx) = mpsc::channel(2);
    let readers = vec![
        tokio::spawn(command_reader(Arc::clone(inner), BufReader::new(cmd_read), lost_tx.clone())),
        tokio::spawn(event_reader(Arc::clone(inner), BufReader::new(evt_stream), lost_tx)),
    ];
    let conn = Connection { readers, lost_rx };

    inner.set_state(SessionState::Handshaking, None, 0);
    if let Err(e) = handshake(inner).await {
        conn.abort();
        return Err(e);
    }
    Ok(conn)
}

async fn connect(host: &str, port: u16, within: Duration) -> Result<TcpStream, SessionError> {
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(within, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(SessionError::Connect(format!("{addr}: {e}"))),
        Err(_) => Err(SessionError::Connect(format!(
            "{addr}: timed out after {}ms",
            within.as_millis()
        ))),
    }
}

/// `ping` must answer `Pong`. A terminal that is up but offline from its
/// server is logged, not refused.
async fn handshake(inner: &Inner) -> Result<(), SessionError> {
    let pong = inner
        .request(Command::ping())
        .await
        .map_err(|e| SessionError::Handshake(e.to_string()))?;
    if pong.as_str() != Some("Pong") {
        return Err(SessionError::Handshake(format!("unexpected ping answer {pong}")));
    }

    match inner.request(Command::is_connected()).await {
        Ok(v) if is_zero(&v) => warn!("terminal is not connected to its server"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "isConnected query failed"),
    }
    Ok(())
}

fn is_zero(v: &Value) -> bool {
    match v {
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.trim() == "0",
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

enum Frame {
    Line(String),
    Oversize,
    Eof,
}

/// Read one newline-terminated frame without buffering more than
/// `MAX_FRAME_BYTES`; an oversize line is skipped to its end.
async fn next_frame<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Frame> {
    let limit = MAX_FRAME_BYTES as u64 + 1;
    buf.clear();
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') || (n as u64) < limit {
        let text = String::from_utf8_lossy(buf);
        return Ok(Frame::Line(text.trim_end_matches(['\r', '\n']).to_string()));
    }
    loop {
        buf.clear();
        let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
        if n == 0 || buf.last() == Some(&b'\n') {
            return Ok(Frame::Oversize);
        }
    }
}

async fn command_reader<R: AsyncBufRead + Unpin>(inner: Arc<Inner>, mut reader: R, lost: mpsc::Sender<String>) {
    let mut buf = Vec::with_capacity(4096);
    let reason = loop {
        match next_frame(&mut reader, &mut buf).await {
            Ok(Frame::Line(line)) => inner.on_command_line(&line),
            Ok(Frame::Oversize) => inner.malformed(DecodeError::Oversize(MAX_FRAME_BYTES + 1), "command"),
            Ok(Frame::Eof) => break "command socket closed".to_string(),
            Err(e) => break format!("command socket error: {e}"),
        }
    };
    // No response can arrive any more.
    inner.pending().fail_all();
    let _ = lost.send(reason).await;
}

async fn event_reader<R: AsyncBufRead + Unpin>(inner: Arc<Inner>, mut reader: R, lost: mpsc::Sender<String>) {
    // Events stay in the socket until the handshake has passed.
    let mut status = inner.status.subscribe();
    if status
        .wait_for(|s| s.state == SessionState::Connected)
        .await
        .is_err()
    {
        return;
    }
    debug!("event reader started");
    let mut buf = Vec::with_capacity(4096);
    let reason = loop {
        match next_frame(&mut reader, &mut buf).await {
            Ok(Frame::Line(line)) => inner.on_event_line(&line).await,
            Ok(Frame::Oversize) => inner.malformed(DecodeError::Oversize(MAX_FRAME_BYTES + 1), "event"),
            Ok(Frame::Eof) => break "event socket closed".to_string(),
            Err(e) => break format!("event socket error: {e}"),
        }
    };
    let _ = lost.send(reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_split_on_newlines_and_skip_oversize() {
        let big = "x".repeat(MAX_FRAME_BYTES + 10);
        let input = format!("{{\"cmd\":\"a\"}}\r\n{big}\nlast");
        let mut reader = BufReader::new(input.as_bytes());
        let mut buf = Vec::new();

        match next_frame(&mut reader, &mut buf).await.unwrap() {
            Frame::Line(l) => assert_eq!(l, "{\"cmd\":\"a\"}"),
            _ => panic!("expected line"),
        }
        assert!(matches!(next_frame(&mut reader, &mut buf).await.unwrap(), Frame::Oversize));
        match next_frame(&mut reader, &mut buf).await.unwrap() {
            Frame::Line(l) => assert_eq!(l, "last"),
            _ => panic!("expected trailing line"),
        }
        assert!(matches!(next_frame(&mut reader, &mut buf).await.unwrap(), Frame::Eof));
    }

    #[test]
    fn zero_answers_are_detected() {
        assert!(is_zero(&Value::from(0)));
        assert!(is_zero(&Value::from("0")));
        assert!(!is_zero(&Value::from(1)));
        assert!(!is_zero(&Value::Null));
    }

    #[test]
    fn config_maps_ports_and_backoff() {
        let cfg = AdapterConfig::default();
        let s = SessionConfig::from_adapter(&cfg);
        assert_eq!(s.command_port, 34130);
        assert_eq!(s.event_port, 34131);
        assert_eq!(s.backoff.max_attempts, 10);
        assert_eq!(s.backoff.initial, Duration::from_millis(500));
    }
}
