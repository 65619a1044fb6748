//! Data model shared across components (spec §3). Panes/windows/sessions are
//! projections rebuilt on every `mux::snapshot()`; the rest are
//! process-lifetime or on-disk state owned by their respective stores.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix timestamp in whole seconds, matching the teacher's `unix_now_secs`.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Integer cell geometry for a pane. All fields are in terminal cells, not
/// pixels, and are always >= 1 for `cols`/`rows`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u32,
    pub rows: u32,
    pub left: u32,
    pub top: u32,
}

/// Status derived from an assistant-process transcript (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantStatus {
    Thinking,
    Done,
    Idle,
}

/// Per-pane metadata tying a pane to an assistant transcript session and its
/// derived status/notification latch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantLink {
    pub session_id: String,
    pub project_path: String,
    pub summary: Option<String>,
    pub status: AssistantStatus,
    pub notified: bool,
    pub viewed_at: Option<u64>,
}

/// One addressable pane. `target` is the stable `session:window.pane` id and
/// is unique across a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pane {
    pub target: String,
    pub pane_id: String,
    pub pid: u32,
    pub geometry: Geometry,
    pub active: bool,
    /// Effective process name after wrapper-skip resolution (spec §4.1).
    pub process: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_session: Option<AssistantLink>,
}

/// One window: an ordered, pane-index-sorted list of panes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub index: u32,
    pub name: String,
    pub panes: Vec<Pane>,
}

/// Window extent in cells (not the geometry of any one pane).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub w: u32,
    pub h: u32,
}

/// One multiplexer session: a unique name, its windows in index order, its
/// last-activity epoch, and its filesystem working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub name: String,
    pub windows: Vec<Window>,
    pub dimensions: Dimensions,
    pub activity: u64,
    pub path: String,
}

/// A snapshot is an immutable list of sessions produced by one CLI
/// invocation; order is as returned by the multiplexer.
pub type Snapshot = Vec<Session>;

/// Reserved path segments that a session name must never equal (they would
/// collide with gateway routes if auto-create ever matched them literally).
pub const RESERVED_SESSION_NAMES: &[&str] = &["api", "ws", "assets"];

/// Validate a session name against spec §3: must match `[^/?#]+` and must
/// not equal a reserved path segment.
pub fn validate_session_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('?')
        && !name.contains('#')
        && !RESERVED_SESSION_NAMES.contains(&name)
}

/// A project entry as returned by `projects.list` / `projects.resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub name: String,
    pub path: String,
    pub score: f64,
}

/// One frecency record, keyed by canonical path in the on-disk history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrecencyEntry {
    pub rank: f64,
    #[serde(rename = "lastAccessed")]
    pub last_accessed: u64,
}
