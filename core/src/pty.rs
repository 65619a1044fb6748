//! PTY Multiplexer: for each client stream, own a pseudo-terminal running
//! `attach-session -t <target>` at the client's reported size, pump bytes
//! both ways, and report exit. Built on `portable_pty`, reusing the
//! three-dedicated-thread shape (blocking reader, resize, exit-poll) so none
//! of it touches a shared async executor.

use crate::error::PtyError;
use dashmap::DashMap;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::sync::{self, Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Unique identifier for one open PTY client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PtyClientId(pub Uuid);

impl PtyClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for PtyClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Whether the attached child is still running, and its exit code if not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Exited { code: u32 },
}

/// Sender to request a PTY resize (cols, rows). A dedicated thread consumes
/// these and calls `master.resize()`.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// Build the environment for an attached child: force a 256-color truecolor
/// terminal and a UTF-8 locale if the parent hasn't set one already.
fn attach_command(target: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new("tmux");
    cmd.arg("attach-session");
    cmd.arg("-t");
    cmd.arg(target);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    if std::env::var_os("LANG").is_none() {
        cmd.env("LANG", "en_US.UTF-8");
    }
    if std::env::var_os("LC_ALL").is_none() {
        cmd.env("LC_ALL", "en_US.UTF-8");
    }
    cmd
}

/// Owns one attached child's stdin writer and a handle to kill/wait on it.
/// The reader, resize, and exit-poll loops each run on their own OS thread
/// so PTY I/O never blocks the async runtime.
pub struct PtyBridge {
    pub writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
}

impl PtyBridge {
    /// Write raw bytes to the child's stdin, unchanged.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| PtyError::Io(std::io::Error::other("pty writer mutex poisoned")))?;
        guard.write_all(bytes).map_err(PtyError::Io)
    }

    /// Signal the child and reap it. Always completes even if the child is
    /// already gone.
    pub fn close(&self) -> Result<(), PtyError> {
        let mut guard = self
            .child
            .lock()
            .map_err(|_| PtyError::Io(std::io::Error::other("pty child mutex poisoned")))?;
        let _ = guard.kill();
        let _ = guard.wait();
        Ok(())
    }
}

/// Spawn `tmux attach-session -t <target>` inside a fresh PTY sized to
/// `(cols, rows)`. Returns the bridge plus channels for reading output,
/// requesting resizes, and observing run-state transitions.
pub fn spawn_attach(
    target: &str,
    cols: u16,
    rows: u16,
) -> Result<(PtyBridge, Option<u32>, mpsc::Receiver<Vec<u8>>, ResizeSender, mpsc::Receiver<RunState>), PtyError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| PtyError::Spawn(std::io::Error::other(e.to_string())))?;

    let cmd = attach_command(target);
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| PtyError::Spawn(std::io::Error::other(e.to_string())))?;
    let pid = child.process_id();

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))?;
    let master = pair.master;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (state_tx, state_rx) = mpsc::channel::<RunState>(10);

    let child = Arc::new(Mutex::new(child));

    // Reads are forwarded exactly as received, never re-chunked, so a
    // multi-byte codepoint or escape sequence can't split across frames.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let size = PtySize {
                cols,
                rows,
                pixel_width: 0,
                pixel_height: 0,
            };
            let _ = master.resize(size);
        }
    });

    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || loop {
        let exit_status = {
            let mut guard = match child_poll.lock() {
                Ok(g) => g,
                Err(_) => break,
            };
            match guard.try_wait() {
                Ok(None) => None,
                Ok(Some(s)) => Some(s.exit_code()),
                Err(_) => break,
            }
        };
        if let Some(code) = exit_status {
            let _ = state_tx.blocking_send(RunState::Exited { code });
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(500));
    });

    let bridge = PtyBridge {
        writer: Arc::new(Mutex::new(writer)),
        child,
    };
    Ok((bridge, pid, rx, resize_tx, state_rx))
}

/// One open PTY client: the entity a Gateway WebSocket handler holds onto
/// for the lifetime of the stream. At most one child PID per client; the
/// child is reaped on close.
pub struct PtyClient {
    pub id: PtyClientId,
    pub target: String,
    pub pid: Option<u32>,
    pub cols: RwLock<u16>,
    pub rows: RwLock<u16>,
    pub alive: std::sync::atomic::AtomicBool,
    bridge: PtyBridge,
    pub resize_tx: ResizeSender,
}

impl PtyClient {
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        self.bridge.write(bytes)
    }

    /// Forward a resize request. Idempotent and best-effort: a request that
    /// arrives after the child has exited is silently dropped.
    pub fn resize(&self, cols: u16, rows: u16) {
        *self.cols.write().expect("cols lock") = cols;
        *self.rows.write().expect("rows lock") = rows;
        let _ = self.resize_tx.send((cols, rows));
    }

    pub fn close(&self) -> Result<(), PtyError> {
        self.alive.store(false, std::sync::atomic::Ordering::SeqCst);
        self.bridge.close()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Registry of open PTY clients, keyed by client id. The Gateway also keeps
/// a `pid -> PtyClientId` index (see `server::gateway`) for the hook
/// endpoint; that map is a weak lookup table, not shared ownership.
pub type PtyRegistry = Arc<DashMap<PtyClientId, Arc<PtyClient>>>;

/// Open a new client attached to `target` and register it. The returned
/// broadcast receiver delivers every chunk read from the child, in order.
pub async fn open(
    registry: &PtyRegistry,
    target: &str,
    cols: u16,
    rows: u16,
) -> Result<(Arc<PtyClient>, broadcast::Receiver<bytes::Bytes>, mpsc::Receiver<RunState>), PtyError> {
    let (bridge, pid, mut reader_rx, resize_tx, state_rx) = spawn_attach(target, cols, rows)?;

    let (live_tx, live_rx) = broadcast::channel::<bytes::Bytes>(256);
    let pump_tx = live_tx.clone();
    tokio::spawn(async move {
        while let Some(chunk) = reader_rx.recv().await {
            let _ = pump_tx.send(bytes::Bytes::from(chunk));
        }
    });

    let client = Arc::new(PtyClient {
        id: PtyClientId::new(),
        target: target.to_string(),
        pid,
        cols: RwLock::new(cols),
        rows: RwLock::new(rows),
        alive: std::sync::atomic::AtomicBool::new(true),
        bridge,
        resize_tx,
    });
    registry.insert(client.id, Arc::clone(&client));

    Ok((client, live_rx, state_rx))
}

/// Remove and close a client. No-op if already removed.
pub fn close(registry: &PtyRegistry, id: PtyClientId) {
    if let Some((_, client)) = registry.remove(&id) {
        let _ = client.close();
    }
}

/// List active tmux sessions (name only). Empty if tmux is unavailable.
pub fn list_tmux_sessions() -> Vec<String> {
    let output = std::process::Command::new("tmux")
        .args(["list-sessions", "-F", "#{session_name}"])
        .output();
    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect(),
        _ => vec![],
    }
}

/// Check whether tmux is available on this system.
pub fn tmux_available() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_renders_as_uuid() {
        let id = PtyClientId::new();
        assert_eq!(id.to_string().len(), 36);
    }

    #[test]
    fn attach_command_builds_without_panicking() {
        let _cmd = attach_command("main:0.0");
    }
}
