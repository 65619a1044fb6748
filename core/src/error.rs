//! Typed errors for each component. The Gateway maps these to HTTP status
//! codes and WebSocket close codes per the error taxonomy; internal code
//! propagates with `?` instead of stringly-typed `Box<dyn Error>`.

use thiserror::Error;

/// Errors from the Multiplexer Adapter (`mux`).
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("pane not found: {0}")]
    PaneNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("invalid session name: {0}")]
    InvalidSessionName(String),
    #[error("multiplexer command `{command}` failed (status {status}): {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("failed to launch multiplexer command: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors from the PTY Multiplexer (`pty`).
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pane not found: {0}")]
    PaneNotFound(String),
    #[error("failed to spawn pty: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("pty client not found: {0}")]
    ClientNotFound(uuid::Uuid),
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
}

/// Errors from the Assistant Watcher (`watcher`).
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("io error reading transcript store: {0}")]
    Io(#[source] std::io::Error),
    #[error("failed to install filesystem watch: {0}")]
    Watch(#[source] notify::Error),
}

/// Errors from the Resolver + Frecency store (`resolver`).
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
    #[error("malformed history file: {0}")]
    Malformed(String),
    #[error("external resolver command failed: {0}")]
    ExternalCommand(String),
}

/// Errors from the Settings Store (`settings`).
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
    #[error("failed to install filesystem watch: {0}")]
    Watch(#[source] notify::Error),
}

/// Errors from the Order Store (`order`).
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
}

/// Umbrella error used where a single function can fail in more than one
/// component (e.g. Gateway handlers that call into both mux and pty).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Order(#[from] OrderError),
}
