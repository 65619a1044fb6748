//! Multiplexer Adapter: builds immutable snapshots of every session, window
//! and pane by shelling out to the multiplexer CLI, and resolves each pane's
//! effective process name by walking the process table in memory.
//!
//! All CLI invocation goes through the `TmuxRunner` trait so tests can
//! substitute canned output instead of spawning a real `tmux`/`ps` binary.

use crate::error::MuxError;
use crate::types::{Dimensions, Geometry, Pane, Session, Snapshot, Window};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Output;
use tokio::process::Command;

/// Commands that are shells or launchers, not the "real" foreground process.
/// A pane reporting one of these gets its process resolved by walking its
/// descendants instead.
const WRAPPER_COMMANDS: &[&str] = &[
    "zsh", "bash", "sh", "fish", "tcsh", "csh", "npm", "npx", "node",
];

/// Maximum number of generations to walk down the process tree looking for
/// a non-wrapper descendant.
const MAX_WRAPPER_DEPTH: u32 = 5;

const PANE_FORMAT: &str = "#{session_name}:#{window_index}.#{pane_index}\t#{session_name}\t\
#{window_index}\t#{window_name}\t#{pane_index}\t#{pane_id}\t#{pane_active}\t#{pane_width}\t\
#{pane_height}\t#{pane_left}\t#{pane_top}\t#{pane_pid}\t#{pane_current_command}\t\
#{session_activity}\t#{session_path}";

/// One `list-windows -a` call per snapshot returns every window's own
/// extent (not any one pane's geometry), batched across all sessions at
/// once rather than one call per session.
const WINDOW_FORMAT: &str = "#{session_name}\t#{window_active}\t#{window_width}\t#{window_height}";

/// Parse `list-windows -a` output into the active (or else first-listed)
/// window's dimensions, keyed by session name.
fn parse_window_dimensions(output: &Output) -> HashMap<String, Dimensions> {
    let text = String::from_utf8_lossy(&output.stdout);
    let mut result: HashMap<String, Dimensions> = HashMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 4 {
            continue;
        }
        let (Ok(w), Ok(h)) = (fields[2].parse::<u32>(), fields[3].parse::<u32>()) else {
            continue;
        };
        let dims = Dimensions { w, h };
        if fields[1] == "1" || !result.contains_key(fields[0]) {
            result.insert(fields[0].to_string(), dims);
        }
    }
    result
}

fn is_wrapper(command: &str) -> bool {
    let stripped = command.strip_prefix('-').unwrap_or(command);
    WRAPPER_COMMANDS.contains(&stripped)
}

/// Abstraction over running the multiplexer (and `ps`) so the adapter can be
/// exercised without a real tmux binary in tests.
#[async_trait]
pub trait TmuxRunner: Send + Sync {
    async fn run(&self, args: &[&str]) -> Result<Output, MuxError>;
    async fn ps(&self) -> Result<Output, MuxError>;
}

/// Runner that shells out to the real `tmux` and `ps` binaries via
/// `tokio::process::Command`, never blocking the caller's executor thread.
#[derive(Debug, Clone, Default)]
pub struct SystemTmuxRunner;

#[async_trait]
impl TmuxRunner for SystemTmuxRunner {
    async fn run(&self, args: &[&str]) -> Result<Output, MuxError> {
        Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(MuxError::Spawn)
    }

    async fn ps(&self) -> Result<Output, MuxError> {
        Command::new("ps")
            .args(["-axo", "pid=,ppid=,comm="])
            .output()
            .await
            .map_err(MuxError::Spawn)
    }
}

/// One row of the process table: pid -> (ppid, command basename).
type ProcessTable = HashMap<u32, (u32, String)>;

fn parse_process_table(output: &Output) -> ProcessTable {
    let mut table = ProcessTable::new();
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(3, char::is_whitespace);
        let pid = parts.next().and_then(|p| p.parse::<u32>().ok());
        let ppid = parts.next().and_then(|p| p.parse::<u32>().ok());
        let comm = parts.next().map(str::trim);
        if let (Some(pid), Some(ppid), Some(comm)) = (pid, ppid, comm) {
            let basename = comm.rsplit('/').next().unwrap_or(comm).to_string();
            table.insert(pid, (ppid, basename));
        }
    }
    table
}

/// Walk at most `MAX_WRAPPER_DEPTH` generations down from `pid`, following
/// the first child (by lowest pid, so the result is deterministic across
/// runs when a wrapper has more than one child) whose command is not in the
/// wrapper set. Returns the original command if no such descendant is found
/// within the depth limit or if `command` was not a wrapper to begin with.
fn resolve_process(pid: u32, command: &str, table: &ProcessTable) -> String {
    if !is_wrapper(command) {
        return command.to_string();
    }
    let mut current = pid;
    for _ in 0..MAX_WRAPPER_DEPTH {
        let mut children: Vec<(u32, &String)> = table
            .iter()
            .filter(|(_, (ppid, _))| *ppid == current)
            .map(|(cpid, (_, comm))| (*cpid, comm))
            .collect();
        children.sort_by_key(|(cpid, _)| *cpid);
        let non_wrapper = children.iter().find(|(_, comm)| !is_wrapper(comm));
        match non_wrapper {
            Some((_, comm)) => return (*comm).clone(),
            None => match children.first() {
                Some((cpid, _)) => current = *cpid,
                None => break,
            },
        }
    }
    command.to_string()
}

struct RawPane {
    session_name: String,
    window_index: u32,
    window_name: String,
    pane_index: u32,
    pane_id: String,
    active: bool,
    width: u32,
    height: u32,
    left: u32,
    top: u32,
    pid: u32,
    command: String,
    activity: u64,
    path: String,
}

fn parse_panes(output: &Output) -> Vec<RawPane> {
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines().filter_map(parse_pane_line).collect()
}

fn parse_pane_line(line: &str) -> Option<RawPane> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 14 {
        return None;
    }
    Some(RawPane {
        session_name: fields[1].to_string(),
        window_index: fields[2].parse().ok()?,
        window_name: fields[3].to_string(),
        pane_index: fields[4].parse().ok()?,
        pane_id: fields[5].to_string(),
        active: fields[6] == "1",
        width: fields[7].parse().unwrap_or(0),
        height: fields[8].parse().unwrap_or(0),
        left: fields[9].parse().unwrap_or(0),
        top: fields[10].parse().unwrap_or(0),
        pid: fields[11].parse().ok()?,
        command: fields[12].to_string(),
        activity: fields[13].parse().unwrap_or(0),
        path: fields.get(14).map(|s| s.to_string()).unwrap_or_default(),
    })
}

/// Produces snapshots and issues mutating commands against the multiplexer.
pub struct MuxAdapter {
    runner: Box<dyn TmuxRunner>,
}

impl MuxAdapter {
    pub fn new() -> Self {
        Self {
            runner: Box::new(SystemTmuxRunner),
        }
    }

    pub fn with_runner(runner: Box<dyn TmuxRunner>) -> Self {
        Self { runner }
    }

    /// Build an immutable snapshot of every session/window/pane. Never
    /// errors: if the CLI is unavailable the result is an empty snapshot.
    pub async fn snapshot(&self) -> Snapshot {
        let panes_fut = self.runner.run(&["list-panes", "-a", "-F", PANE_FORMAT]);
        let ps_fut = self.runner.ps();
        let windows_fut = self.runner.run(&["list-windows", "-a", "-F", WINDOW_FORMAT]);
        let (panes_out, ps_out, windows_out) = tokio::join!(panes_fut, ps_fut, windows_fut);

        let panes_out = match panes_out {
            Ok(o) if o.status.success() => o,
            _ => return Vec::new(),
        };
        let table = ps_out.as_ref().map(parse_process_table).unwrap_or_default();
        let raw_panes = parse_panes(&panes_out);

        let mut sessions = build_sessions(raw_panes, &table);

        // Window extent is the active window's own size, not any one pane's
        // geometry (a split window's panes are each smaller than the window).
        // Fetched with a single `list-windows -a` call covering every
        // session at once, rather than one call per session.
        if let Ok(windows_out) = windows_out {
            if windows_out.status.success() {
                let dims_by_session = parse_window_dimensions(&windows_out);
                for session in &mut sessions {
                    if let Some(d) = dims_by_session.get(&session.name) {
                        session.dimensions = *d;
                    }
                }
            }
        }

        sessions
    }

    pub async fn create_session(&self, name: &str, cwd: &str) -> Result<(), MuxError> {
        if !crate::types::validate_session_name(name) {
            return Err(MuxError::InvalidSessionName(name.to_string()));
        }
        let out = self
            .runner
            .run(&["new-session", "-d", "-s", name, "-c", cwd])
            .await?;
        check_ignoring(&out, "new-session", &["duplicate session"])
    }

    pub async fn kill_pane(&self, target: &str) -> Result<(), MuxError> {
        let out = self.runner.run(&["kill-pane", "-t", target]).await?;
        check_ignoring(&out, "kill-pane", &["can't find pane", "not found"])
    }

    pub async fn kill_session(&self, name: &str) -> Result<(), MuxError> {
        let out = self.runner.run(&["kill-session", "-t", name]).await?;
        check_ignoring(&out, "kill-session", &["can't find session", "not found"])
    }

    pub async fn send_keys(&self, target: &str, text: &str, literal: bool) -> Result<(), MuxError> {
        let out = if literal {
            self.runner.run(&["send-keys", "-t", target, "-l", text]).await?
        } else {
            self.runner.run(&["send-keys", "-t", target, text, "Enter"]).await?
        };
        check_ignoring(&out, "send-keys", &[])
    }

    pub async fn send_interrupt(&self, target: &str) -> Result<(), MuxError> {
        let out = self.runner.run(&["send-keys", "-t", target, "C-c"]).await?;
        check_ignoring(&out, "send-keys", &[])
    }

    /// Press Enter as its own keystroke, independent of `send_keys`'s literal
    /// mode (which cannot express the "Enter" key name alongside `-l` text).
    pub async fn send_enter(&self, target: &str) -> Result<(), MuxError> {
        let out = self.runner.run(&["send-keys", "-t", target, "Enter"]).await?;
        check_ignoring(&out, "send-keys", &[])
    }

    /// Install a global hook that calls back to `callback_url` with the
    /// client's pid and new session name whenever a client switches
    /// sessions. Idempotent: re-installing replaces the previous hook.
    pub async fn install_session_changed_hook(&self, callback_url: &str) -> Result<(), MuxError> {
        let shell = format!(
            "run-shell \"curl -s '{callback_url}?pid=#{{client_pid}}&session=#{{session_name}}' >/dev/null 2>&1\""
        );
        let out = self
            .runner
            .run(&["set-hook", "-g", "client-session-changed", &shell])
            .await?;
        check_ignoring(&out, "set-hook", &[])
    }

    /// Remove the client-session-changed hook. Called on shutdown so a
    /// lingering multiplexer server doesn't keep curling a dead process.
    pub async fn uninstall_session_changed_hook(&self) -> Result<(), MuxError> {
        let out = self.runner.run(&["set-hook", "-gu", "client-session-changed"]).await?;
        check_ignoring(&out, "set-hook", &[])
    }

    pub async fn get_pane_info(&self, target: &str) -> Result<Pane, MuxError> {
        let snapshot = self.snapshot().await;
        snapshot
            .into_iter()
            .flat_map(|s| s.windows.into_iter())
            .flat_map(|w| w.panes.into_iter())
            .find(|p| p.target == target)
            .ok_or_else(|| MuxError::PaneNotFound(target.to_string()))
    }

    pub async fn pane_cwd(&self, target: &str) -> Result<String, MuxError> {
        let out = self
            .runner
            .run(&["display-message", "-p", "-t", target, "#{pane_current_path}"])
            .await?;
        if !out.status.success() {
            return Err(MuxError::PaneNotFound(target.to_string()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Capture a pane's most recent on-screen output, escape sequences
    /// included (`-e`), so the caller can sniff for the assistant's animated
    /// thinking indicator (spec §4.4's secondary "is thinking right now"
    /// signal). Empty on any failure — this is a best-effort hint, never a
    /// hard dependency.
    pub async fn capture_pane_tail(&self, target: &str) -> String {
        let Ok(out) = self.runner.run(&["capture-pane", "-p", "-e", "-t", target]).await else {
            return String::new();
        };
        if !out.status.success() {
            return String::new();
        }
        String::from_utf8_lossy(&out.stdout).to_string()
    }
}

/// An escape-colored ellipsis in a pane's recent output — the assistant's
/// animated "thinking" indicator — overrides the transcript-derived status
/// to `Thinking` regardless of transcript mtime age (spec §4.4).
pub fn shows_live_thinking_indicator(captured: &str) -> bool {
    captured.contains('\u{2026}') && captured.contains('\u{1b}')
}

impl Default for MuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn check_ignoring(out: &Output, command: &str, ignore_patterns: &[&str]) -> Result<(), MuxError> {
    if out.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&out.stderr);
    if ignore_patterns.iter().any(|p| stderr.contains(p)) {
        return Ok(());
    }
    Err(MuxError::CommandFailed {
        command: command.to_string(),
        status: out.status.code().unwrap_or(-1),
        stderr: stderr.trim().to_string(),
    })
}

fn build_sessions(raw_panes: Vec<RawPane>, table: &ProcessTable) -> Snapshot {
    let mut sessions: Vec<Session> = Vec::new();

    for raw in raw_panes {
        let target = format!("{}:{}.{}", raw.session_name, raw.window_index, raw.pane_index);
        let process = resolve_process(raw.pid, &raw.command, table);
        let pane = Pane {
            target,
            pane_id: raw.pane_id,
            pid: raw.pid,
            geometry: Geometry {
                cols: raw.width,
                rows: raw.height,
                left: raw.left,
                top: raw.top,
            },
            active: raw.active,
            process,
            claude_session: None,
        };

        let session = match sessions.iter_mut().find(|s| s.name == raw.session_name) {
            Some(s) => s,
            None => {
                sessions.push(Session {
                    name: raw.session_name.clone(),
                    windows: Vec::new(),
                    dimensions: Dimensions { w: 0, h: 0 },
                    activity: raw.activity,
                    path: raw.path.clone(),
                });
                sessions.last_mut().unwrap()
            }
        };
        session.activity = session.activity.max(raw.activity);

        let window = match session.windows.iter_mut().find(|w| w.index == raw.window_index) {
            Some(w) => w,
            None => {
                session.windows.push(Window {
                    index: raw.window_index,
                    name: raw.window_name.clone(),
                    panes: Vec::new(),
                });
                session.windows.last_mut().unwrap()
            }
        };
        window.panes.push(pane);
    }

    for session in &mut sessions {
        session.windows.sort_by_key(|w| w.index);
        for window in &mut session.windows {
            window.panes.sort_by(|a, b| {
                let idx = |p: &Pane| p.target.rsplit('.').next().and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);
                idx(a).cmp(&idx(b))
            });
        }
        if let Some(first) = session.windows.first() {
            if let Some(pane) = first.panes.first() {
                session.dimensions = Dimensions {
                    w: pane.geometry.cols,
                    h: pane.geometry.rows,
                };
            }
        }
    }

    sessions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn ok_output(stdout: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    fn fail_output(stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(1 << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    struct FakeRunner {
        panes: String,
        ps: String,
    }

    #[async_trait]
    impl TmuxRunner for FakeRunner {
        async fn run(&self, args: &[&str]) -> Result<Output, MuxError> {
            if args.first() == Some(&"list-panes") {
                Ok(ok_output(&self.panes))
            } else {
                Ok(ok_output(""))
            }
        }

        async fn ps(&self) -> Result<Output, MuxError> {
            Ok(ok_output(&self.ps))
        }
    }

    fn pane_line(
        target: &str,
        session: &str,
        window_idx: u32,
        window_name: &str,
        pane_idx: u32,
        pane_id: &str,
        active: &str,
        pid: u32,
        command: &str,
    ) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t80\t24\t0\t0\t{}\t{}\t1000\t/home/u/proj",
            target, session, window_idx, window_name, pane_idx, pane_id, active, pid, command
        )
    }

    #[tokio::test]
    async fn snapshot_groups_and_orders_panes() {
        let panes = vec![
            pane_line("main:0.1", "main", 0, "editor", 1, "%2", "0", 11, "vim"),
            pane_line("main:0.0", "main", 0, "editor", 0, "%1", "1", 10, "zsh"),
            pane_line("main:1.0", "main", 1, "shell", 0, "%3", "0", 12, "bash"),
        ]
        .join("\n");
        let runner = FakeRunner {
            panes,
            ps: "10 1 zsh\n20 10 node\n".to_string(),
        };
        let adapter = MuxAdapter::with_runner(Box::new(runner));
        let snapshot = adapter.snapshot().await;

        assert_eq!(snapshot.len(), 1);
        let session = &snapshot[0];
        assert_eq!(session.windows.len(), 2);
        assert_eq!(session.windows[0].index, 0);
        assert_eq!(session.windows[0].panes[0].target, "main:0.0");
        assert_eq!(session.windows[0].panes[1].target, "main:0.1");
    }

    #[tokio::test]
    async fn process_resolution_skips_wrapper_chain() {
        let panes = vec![pane_line("x:0.0", "x", 0, "w", 0, "%1", "1", 10, "zsh")].join("\n");
        let runner = FakeRunner {
            panes,
            ps: "10 1 zsh\n20 10 node\n30 20 vim\n".to_string(),
        };
        let adapter = MuxAdapter::with_runner(Box::new(runner));
        let snapshot = adapter.snapshot().await;
        assert_eq!(snapshot[0].windows[0].panes[0].process, "vim");
    }

    #[test]
    fn wrapper_with_multiple_children_picks_lowest_pid_deterministically() {
        // pid 1 (zsh) has two non-wrapper children, 50 and 30; insertion order
        // is deliberately not pid order so this only passes if the resolver
        // sorts rather than relying on HashMap iteration order.
        let mut table = ProcessTable::new();
        table.insert(50, (1, "node".to_string()));
        table.insert(30, (1, "vim".to_string()));
        table.insert(1, (0, "zsh".to_string()));
        assert_eq!(resolve_process(1, "zsh", &table), "vim");
    }

    #[test]
    fn wrapper_descends_into_lowest_pid_wrapper_child_when_all_children_are_wrappers() {
        let mut table = ProcessTable::new();
        table.insert(1, (0, "zsh".to_string()));
        table.insert(30, (1, "node".to_string()));
        table.insert(20, (1, "npm".to_string()));
        table.insert(40, (20, "vim".to_string()));
        assert_eq!(resolve_process(1, "zsh", &table), "vim");
    }

    #[tokio::test]
    async fn non_wrapper_command_is_returned_unchanged() {
        let panes = vec![pane_line("x:0.0", "x", 0, "w", 0, "%1", "1", 10, "vim")].join("\n");
        let runner = FakeRunner {
            panes,
            ps: "10 1 vim\n".to_string(),
        };
        let adapter = MuxAdapter::with_runner(Box::new(runner));
        let snapshot = adapter.snapshot().await;
        assert_eq!(snapshot[0].windows[0].panes[0].process, "vim");
    }

    #[tokio::test]
    async fn session_dimensions_come_from_active_window_not_pane_geometry() {
        struct WindowedRunner {
            panes: String,
        }
        #[async_trait]
        impl TmuxRunner for WindowedRunner {
            async fn run(&self, args: &[&str]) -> Result<Output, MuxError> {
                if args.first() == Some(&"list-panes") {
                    Ok(ok_output(&self.panes))
                } else if args.first() == Some(&"list-windows") {
                    Ok(ok_output("main\t0\t60\t20\nmain\t1\t160\t48\n"))
                } else {
                    Ok(ok_output(""))
                }
            }
            async fn ps(&self) -> Result<Output, MuxError> {
                Ok(ok_output(""))
            }
        }
        let panes = pane_line("main:0.0", "main", 0, "editor", 0, "%1", "1", 10, "vim");
        let runner = WindowedRunner { panes };
        let adapter = MuxAdapter::with_runner(Box::new(runner));
        let snapshot = adapter.snapshot().await;
        assert_eq!(snapshot[0].dimensions.w, 160);
        assert_eq!(snapshot[0].dimensions.h, 48);
    }

    #[tokio::test]
    async fn unavailable_cli_yields_empty_snapshot() {
        struct FailingRunner;
        #[async_trait]
        impl TmuxRunner for FailingRunner {
            async fn run(&self, _args: &[&str]) -> Result<Output, MuxError> {
                Ok(fail_output("tmux: command not found"))
            }
            async fn ps(&self) -> Result<Output, MuxError> {
                Ok(ok_output(""))
            }
        }
        let adapter = MuxAdapter::with_runner(Box::new(FailingRunner));
        assert!(adapter.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn kill_session_ignores_not_found_error() {
        struct NotFoundRunner;
        #[async_trait]
        impl TmuxRunner for NotFoundRunner {
            async fn run(&self, _args: &[&str]) -> Result<Output, MuxError> {
                Ok(fail_output("session not found: x"))
            }
            async fn ps(&self) -> Result<Output, MuxError> {
                Ok(ok_output(""))
            }
        }
        let adapter = MuxAdapter::with_runner(Box::new(NotFoundRunner));
        assert!(adapter.kill_session("x").await.is_ok());
    }

    #[test]
    fn live_thinking_indicator_needs_both_escape_and_ellipsis() {
        assert!(shows_live_thinking_indicator("\u{1b}[38;5;215mThinking\u{2026}\u{1b}[0m"));
        assert!(!shows_live_thinking_indicator("Thinking\u{2026}"));
        assert!(!shows_live_thinking_indicator("\u{1b}[38;5;215mReady\u{1b}[0m"));
    }

    #[test]
    fn invalid_session_name_rejects_reserved_and_slashes() {
        assert!(!crate::types::validate_session_name("api"));
        assert!(!crate::types::validate_session_name("a/b"));
        assert!(crate::types::validate_session_name("acme"));
    }
}
