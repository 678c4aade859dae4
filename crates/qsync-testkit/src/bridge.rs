//! In-process bridge double.
//!
//! Listens on two ephemeral ports like the real bridge, answers commands from
//! scripted handlers, pushes events on demand and can drop every connection
//! to simulate an outage.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use qsync_config::AdapterConfig;
use qsync_schemas::{Bar, SeriesKey};

use crate::payloads;

/// What a handler tells the bridge to do with one command.
#[derive(Debug, Clone)]
pub enum MockReply {
    Data(Value),
    LuaError(String),
    /// Swallow the command; the caller times out.
    NoReply,
    /// Drop every connection instead of answering.
    Disconnect,
}

pub type Handler = Arc<dyn Fn(&Value) -> MockReply + Send + Sync>;

#[derive(Default)]
struct Shared {
    handlers: Mutex<HashMap<String, Handler>>,
    received: Mutex<Vec<(String, Value)>>,
    event_clients: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    refuse: AtomicBool,
    command_connections: AtomicUsize,
    kill: Mutex<Option<broadcast::Sender<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Shared {
    fn kill_rx(&self) -> broadcast::Receiver<()> {
        let mut k = lock(&self.kill);
        k.get_or_insert_with(|| broadcast::channel(4).0).subscribe()
    }

    fn kill_all(&self) {
        if let Some(k) = lock(&self.kill).as_ref() {
            let _ = k.send(());
        }
        lock(&self.event_clients).clear();
    }
}

pub struct MockBridge {
    shared: Arc<Shared>,
    command_addr: SocketAddr,
    event_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl MockBridge {
    /// Bind both listeners on `127.0.0.1:0`. Answers `ping` with `Pong` and
    /// `isConnected` with `1` until overridden.
    pub async fn start() -> Result<Self> {
        let cmd_listener = TcpListener::bind("127.0.0.1:0").await.context("bind command port")?;
        let evt_listener = TcpListener::bind("127.0.0.1:0").await.context("bind event port")?;
        let command_addr = cmd_listener.local_addr()?;
        let event_addr = evt_listener.local_addr()?;

        let shared = Arc::new(Shared::default());
        let bridge_tasks = vec![
            tokio::spawn(accept_commands(Arc::clone(&shared), cmd_listener)),
            tokio::spawn(accept_events(Arc::clone(&shared), evt_listener)),
        ];

        let bridge = Self {
            shared,
            command_addr,
            event_addr,
            tasks: bridge_tasks,
        };
        bridge.on_data("ping", json!("Pong"));
        bridge.on_data("isConnected", json!(1));
        Ok(bridge)
    }

    pub fn command_port(&self) -> u16 {
        self.command_addr.port()
    }

    pub fn event_port(&self) -> u16 {
        self.event_addr.port()
    }

    /// Adapter config pointing at this bridge, with short timeouts.
    pub fn adapter_config(&self, data_dir: &Path) -> AdapterConfig {
        AdapterConfig {
            host: "127.0.0.1".to_string(),
            port: self.command_port(),
            event_port: Some(self.event_port()),
            data_dir: data_dir.to_path_buf(),
            command_timeout_ms: 1_000,
            connect_timeout_ms: 500,
            initial_backoff_ms: 20,
            max_backoff_ms: 100,
            max_reconnect_attempts: 20,
            snapshot_interval_secs: 3_600,
            account_refresh_secs: 0,
            ..AdapterConfig::default()
        }
    }

    pub fn on(&self, cmd: &str, f: impl Fn(&Value) -> MockReply + Send + Sync + 'static) {
        lock(&self.shared.handlers).insert(cmd.to_string(), Arc::new(f));
    }

    pub fn on_data(&self, cmd: &str, data: Value) {
        self.on(cmd, move |_| MockReply::Data(data.clone()));
    }

    /// Serve `get_candles_from_data_source` from `book`.
    pub fn serve_candles(&self, book: Arc<CandleBook>) {
        self.on("get_candles_from_data_source", move |req| MockReply::Data(book.page(req)));
    }

    pub fn push_event(&self, name: &str, data: Value) -> usize {
        self.push_raw(&json!({ "cmd": name, "data": data, "t": 0 }).to_string())
    }

    /// Send one raw line to every event client; returns how many got it.
    pub fn push_raw(&self, line: &str) -> usize {
        let mut clients = lock(&self.shared.event_clients);
        clients.retain(|tx| tx.send(line.to_string()).is_ok());
        clients.len()
    }

    pub fn disconnect_all(&self) {
        self.shared.kill_all();
    }

    /// While set, new connections are accepted and dropped at once.
    pub fn set_refuse(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn received(&self, cmd: &str) -> Vec<Value> {
        lock(&self.shared.received)
            .iter()
            .filter(|(c, _)| c == cmd)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn command_connections(&self) -> usize {
        self.shared.command_connections.load(Ordering::SeqCst)
    }

    /// Poll until at least `n` event clients are attached.
    pub async fn wait_event_clients(&self, n: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            {
                let mut clients = lock(&self.shared.event_clients);
                clients.retain(|tx| !tx.is_closed());
                if clients.len() >= n {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockBridge {
    fn drop(&mut self) {
        self.shared.kill_all();
        for t in &self.tasks {
            t.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Accept loops
// ---------------------------------------------------------------------------

async fn accept_commands(shared: Arc<Shared>, listener: TcpListener) {
    while let Ok((sock, _)) = listener.accept().await {
        if shared.refuse.load(Ordering::SeqCst) {
            drop(sock);
            continue;
        }
        shared.command_connections.fetch_add(1, Ordering::SeqCst);
        let kill = shared.kill_rx();
        tokio::spawn(serve_commands(Arc::clone(&shared), sock, kill));
    }
}

async fn serve_commands(shared: Arc<Shared>, sock: TcpStream, mut kill: broadcast::Receiver<()>) {
    let (read, mut write) = sock.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = tokio::select! {
            _ = kill.recv() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };
        let Ok(req) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let id = req.get("id").cloned().unwrap_or(Value::Null);
        let cmd = req.get("cmd").and_then(Value::as_str).unwrap_or_default().to_string();
        let data = req.get("data").cloned().unwrap_or(Value::Null);
        lock(&shared.received).push((cmd.clone(), data.clone()));

        let handler = lock(&shared.handlers).get(&cmd).cloned();
        let reply = match handler {
            Some(h) => h(&data),
            None => MockReply::LuaError(format!("unknown command {cmd}")),
        };
        let out = match reply {
            MockReply::Data(d) => json!({ "id": id, "cmd": cmd, "data": d, "t": 0 }),
            MockReply::LuaError(e) => json!({ "id": id, "cmd": cmd, "lua_error": e, "t": 0 }),
            MockReply::NoReply => continue,
            MockReply::Disconnect => {
                shared.kill_all();
                break;
            }
        };
        let mut text = out.to_string();
        text.push('\n');
        if write.write_all(text.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn accept_events(shared: Arc<Shared>, listener: TcpListener) {
    while let Ok((sock, _)) = listener.accept().await {
        if shared.refuse.load(Ordering::SeqCst) {
            drop(sock);
            continue;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&shared.event_clients).push(tx);
        let kill = shared.kill_rx();
        tokio::spawn(serve_events(sock, rx, kill));
    }
}

async fn serve_events(
    mut sock: TcpStream,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut kill: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = kill.recv() => break,
            line = rx.recv() => {
                let Some(mut line) = line else { break };
                line.push('\n');
                if sock.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CandleBook
// ---------------------------------------------------------------------------

/// Scripted history for one series, paged like the bridge: up to `count`
/// bars strictly before `to` (the latest bars when `to` is null), ascending.
pub struct CandleBook {
    series: SeriesKey,
    bars: Mutex<Vec<Bar>>,
}

impl CandleBook {
    pub fn new(series: SeriesKey, bars: Vec<Bar>) -> Arc<Self> {
        Arc::new(Self {
            series,
            bars: Mutex::new(bars),
        })
    }

    pub fn push(&self, bar: Bar) {
        lock(&self.bars).push(bar);
    }

    pub fn page(&self, req: &Value) -> Value {
        let count = req.get("count").and_then(Value::as_u64).unwrap_or(0) as usize;
        let to = req
            .get("to")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok());

        let bars = lock(&self.bars);
        let eligible: Vec<&Bar> = bars
            .iter()
            .filter(|b| to.map_or(true, |to| b.open_time < to))
            .collect();
        let start = eligible.len().saturating_sub(count);
        Value::Array(
            eligible[start..]
                .iter()
                .map(|b| payloads::candle(&self.series, b))
                .collect(),
        )
    }
}
