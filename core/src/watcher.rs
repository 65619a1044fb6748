//! Assistant Watcher: derives a per-pane `thinking | done | idle` status
//! from an assistant process's on-disk transcript, and maintains a one-shot
//! "needs attention" latch per transcript session.
//!
//! The recursive watch + debounce shape is the same reset-sleep pattern
//! used for the settings file watch in `settings.rs`: events accumulate in
//! a pending set and a single timer is pushed back on every new event,
//! firing once activity quiesces for `DEBOUNCE_MS`.

use crate::error::WatcherError;
use crate::types::{unix_now_secs, AssistantLink, AssistantStatus};
use dashmap::DashMap;
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Directory under `$HOME` where the assistant keeps per-project transcript
/// folders, one subdirectory per slugged project path.
const ASSISTANT_ROOT: &str = ".claude/projects";

const DEBOUNCE_MS: u64 = 300;

/// Only the tail of a transcript is read to derive status; transcripts can
/// grow to many megabytes and we only need the last complete JSON line.
const TAIL_BYTES: u64 = 10 * 1024;

fn slug_project_path(path: &str) -> String {
    path.replace('/', "-")
}

/// One entry as listed in an optional `sessions-index.json`, or synthesized
/// when enumerating `*.jsonl` directly.
#[derive(Debug, Clone)]
pub struct TranscriptMeta {
    pub session_id: String,
    pub full_path: PathBuf,
    pub summary: Option<String>,
    pub modified: u64,
}

/// Discover every transcript for a project. Prefers `sessions-index.json`
/// when present; otherwise enumerates `*.jsonl` files directly.
pub fn discover_transcripts(home: &Path, project_path: &str) -> Vec<TranscriptMeta> {
    let dir = home.join(ASSISTANT_ROOT).join(slug_project_path(project_path));
    if !dir.is_dir() {
        return Vec::new();
    }

    let index_path = dir.join("sessions-index.json");
    if let Ok(text) = std::fs::read_to_string(&index_path) {
        if let Ok(entries) = serde_json::from_str::<Vec<IndexEntry>>(&text) {
            return entries
                .into_iter()
                .map(|e| TranscriptMeta {
                    session_id: e.session_id,
                    full_path: PathBuf::from(e.full_path),
                    summary: e.summary,
                    modified: e.modified,
                })
                .collect();
        }
    }

    let mut out = Vec::new();
    let Ok(read_dir) = std::fs::read_dir(&dir) else {
        return out;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        out.push(TranscriptMeta {
            session_id: stem.to_string(),
            full_path: path,
            summary: None,
            modified,
        });
    }
    out
}

#[derive(serde::Deserialize)]
struct IndexEntry {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "fullPath")]
    full_path: String,
    summary: Option<String>,
    modified: u64,
}

#[derive(serde::Deserialize)]
struct TranscriptLine {
    #[serde(rename = "type")]
    kind: String,
}

/// Read the tail of a transcript and derive its status from the last
/// complete JSON line (spec §4.4).
pub fn derive_status(path: &Path) -> AssistantStatus {
    let Ok(mut file) = std::fs::File::open(path) else {
        return AssistantStatus::Idle;
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(TAIL_BYTES);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return AssistantStatus::Idle;
    }
    let mut buf = String::new();
    if file.read_to_string(&mut buf).is_err() {
        return AssistantStatus::Idle;
    }

    let mtime_secs = std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let now = unix_now_secs();
    let age = now.saturating_sub(mtime_secs);

    let Some(last_line) = buf.lines().rev().find(|l| !l.trim().is_empty()) else {
        return AssistantStatus::Idle;
    };
    let Ok(parsed) = serde_json::from_str::<TranscriptLine>(last_line) else {
        return AssistantStatus::Idle;
    };

    match parsed.kind.as_str() {
        "summary" => AssistantStatus::Done,
        "user" => {
            if age < 60 {
                AssistantStatus::Thinking
            } else {
                AssistantStatus::Done
            }
        }
        "assistant" => {
            if age < 3 {
                AssistantStatus::Thinking
            } else {
                AssistantStatus::Done
            }
        }
        _ => AssistantStatus::Idle,
    }
}

/// Per-sessionId latch state (spec §4.4). `prev_status` drives the
/// `thinking -> done` edge detection.
#[derive(Debug, Clone)]
struct LatchState {
    notified: bool,
    viewed_at: Option<u64>,
    prev_status: AssistantStatus,
    project_path: String,
    summary: Option<String>,
    status: AssistantStatus,
    modified: u64,
}

impl LatchState {
    fn apply(&mut self, new_status: AssistantStatus) {
        if self.prev_status == AssistantStatus::Thinking && new_status == AssistantStatus::Done {
            self.notified = true;
        }
        if new_status == AssistantStatus::Done && !self.notified && self.viewed_at.is_none() {
            self.notified = true;
        }
        if self.prev_status == AssistantStatus::Done && new_status != AssistantStatus::Done {
            self.viewed_at = None;
        }
        self.status = new_status;
        self.prev_status = new_status;
    }
}

/// Watches every project's transcript directory it has been asked about and
/// exposes derived status/latch state. Cheap to clone: internal state is
/// behind `Arc`.
#[derive(Clone)]
pub struct AssistantWatcher {
    home: Arc<PathBuf>,
    latches: Arc<DashMap<String, LatchState>>,
    /// Every project path the watcher has been asked about, keyed by its
    /// slug, so a filesystem event naming only a slug (a directory name)
    /// can be mapped back to the project path `scan_project` needs.
    known_projects: Arc<DashMap<String, String>>,
}

impl AssistantWatcher {
    pub fn new(home: PathBuf) -> Self {
        Self {
            home: Arc::new(home),
            latches: Arc::new(DashMap::new()),
            known_projects: Arc::new(DashMap::new()),
        }
    }

    /// Re-derive status for one transcript and run the latch transition.
    /// Called on filesystem events and on first discovery.
    pub fn refresh(&self, project_path: &str, meta: &TranscriptMeta) {
        let status = derive_status(&meta.full_path);
        let mut entry = self.latches.entry(meta.session_id.clone()).or_insert_with(|| LatchState {
            notified: false,
            viewed_at: None,
            prev_status: AssistantStatus::Idle,
            project_path: project_path.to_string(),
            summary: meta.summary.clone(),
            status: AssistantStatus::Idle,
            modified: meta.modified,
        });
        entry.project_path = project_path.to_string();
        entry.summary = meta.summary.clone();
        entry.modified = meta.modified;
        entry.apply(status);
    }

    /// The most-recently-modified known session for a project, if any,
    /// rendered as an `AssistantLink` for pane enrichment.
    pub fn active_session_for_project(&self, project_path: &str) -> Option<AssistantLink> {
        self.latches
            .iter()
            .filter(|e| e.value().project_path == project_path)
            .max_by_key(|e| e.value().modified)
            .map(|e| AssistantLink {
                session_id: e.key().clone(),
                project_path: e.value().project_path.clone(),
                summary: e.value().summary.clone(),
                status: e.value().status,
                notified: e.value().notified,
                viewed_at: e.value().viewed_at,
            })
    }

    /// Clear the notification latch for a transcript session.
    pub fn mark_viewed(&self, session_id: &str) {
        if let Some(mut entry) = self.latches.get_mut(session_id) {
            entry.notified = false;
            entry.viewed_at = Some(unix_now_secs());
        }
    }

    /// Discover and refresh every transcript for a project path right now,
    /// without waiting for a filesystem event. Used on first pane linkage.
    pub fn scan_project(&self, project_path: &str) {
        self.known_projects
            .insert(slug_project_path(project_path), project_path.to_string());
        for meta in discover_transcripts(&self.home, project_path) {
            self.refresh(project_path, &meta);
        }
    }

    /// Install a recursive watch over the assistant's transcript root. On
    /// every debounced batch of `.jsonl` changes, re-scans every project
    /// whose slug directory changed (but only projects already known via
    /// `scan_project` — an event under a slug nobody has asked about yet
    /// has nothing to refresh). Runs forever on a spawned task; never
    /// blocks the caller.
    pub async fn watch(self) -> Result<(), WatcherError> {
        let root = self.home.join(ASSISTANT_ROOT);
        tokio::fs::create_dir_all(&root).await.map_err(WatcherError::Io)?;

        let (tx, mut rx) = mpsc::channel::<notify::Event>(2048);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.try_send(event);
                }
            },
            Config::default().with_poll_interval(Duration::from_millis(500)),
        )
        .map_err(WatcherError::Watch)?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(WatcherError::Watch)?;

        let this = self.clone();
        tokio::spawn(async move {
            // Keep the watcher alive for the task's lifetime.
            let _watcher = watcher;
            let mut pending: HashSet<String> = HashSet::new();
            let debounce = tokio::time::sleep(Duration::from_secs(3600));
            tokio::pin!(debounce);

            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            continue;
                        }
                        for path in &event.paths {
                            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                                continue;
                            }
                            if let Some(slug) = project_slug_from_path(&root, path) {
                                pending.insert(slug);
                            }
                        }
                        debounce.as_mut().reset(tokio::time::Instant::now() + Duration::from_millis(DEBOUNCE_MS));
                    }
                    _ = &mut debounce => {
                        if pending.is_empty() {
                            debounce.as_mut().reset(tokio::time::Instant::now() + Duration::from_secs(3600));
                            continue;
                        }
                        for slug in pending.drain() {
                            if let Some(project_path) = this.known_projects.get(&slug).map(|e| e.value().clone()) {
                                this.scan_project(&project_path);
                            }
                        }
                        debounce.as_mut().reset(tokio::time::Instant::now() + Duration::from_secs(3600));
                    }
                }
            }
        });

        debug!(root = %root.display(), "assistant transcript watch installed");
        Ok(())
    }
}

fn project_slug_from_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    relative.components().next().map(|c| c.as_os_str().to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_transcript(dir: &Path, session_id: &str, line: &str) -> PathBuf {
        let path = dir.join(format!("{session_id}.jsonl"));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{line}").unwrap();
        path
    }

    #[test]
    fn summary_line_is_done() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_transcript(tmp.path(), "abc", r#"{"type":"summary"}"#);
        assert_eq!(derive_status(&path), AssistantStatus::Done);
    }

    #[test]
    fn recent_user_line_is_thinking() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_transcript(tmp.path(), "abc", r#"{"type":"user"}"#);
        assert_eq!(derive_status(&path), AssistantStatus::Thinking);
    }

    #[test]
    fn malformed_line_is_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_transcript(tmp.path(), "abc", "not json");
        assert_eq!(derive_status(&path), AssistantStatus::Idle);
    }

    #[test]
    fn latch_sets_notified_on_thinking_to_done_transition() {
        let mut state = LatchState {
            notified: false,
            viewed_at: None,
            prev_status: AssistantStatus::Thinking,
            project_path: "/p".to_string(),
            summary: None,
            status: AssistantStatus::Thinking,
            modified: 0,
        };
        state.apply(AssistantStatus::Done);
        assert!(state.notified);
    }

    #[test]
    fn mark_viewed_clears_notified() {
        let watcher = AssistantWatcher::new(std::env::temp_dir());
        watcher.latches.insert(
            "abc".to_string(),
            LatchState {
                notified: true,
                viewed_at: None,
                prev_status: AssistantStatus::Done,
                project_path: "/p".to_string(),
                summary: None,
                status: AssistantStatus::Done,
                modified: 0,
            },
        );
        watcher.mark_viewed("abc");
        let link = watcher.active_session_for_project("/p").unwrap();
        assert!(!link.notified);
        assert!(link.viewed_at.is_some());
    }

    #[test]
    fn leaving_done_clears_viewed_at() {
        let mut state = LatchState {
            notified: false,
            viewed_at: Some(100),
            prev_status: AssistantStatus::Done,
            project_path: "/p".to_string(),
            summary: None,
            status: AssistantStatus::Done,
            modified: 0,
        };
        state.apply(AssistantStatus::Thinking);
        assert!(state.viewed_at.is_none());
    }
}
