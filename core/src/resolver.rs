//! Resolver + Frecency: maps a user-entered project name to a canonical
//! `{name, path}` pair. Modeled as an explicit tagged enum rather than a
//! trait object — only one strategy is ever active, selected via settings,
//! so dynamic dispatch buys nothing but an extra allocation.

use crate::error::ResolverError;
use crate::types::{FrecencyEntry, ProjectEntry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::warn;

const HISTORY_FILE: &str = "history.json";
const DEFAULT_IGNORED_BASENAMES: &[&str] = &["node_modules", ".git", "vendor", "target", "dist"];
const DEFAULT_MAX_DEPTH: u32 = 3;
const RESCAN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// On-disk frecency history: canonical path -> {rank, lastAccessed}. Writes
/// are whole-file rewrites, atomic via write-to-`.tmp`-then-rename.
pub struct FrecencyStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, FrecencyEntry>>,
}

impl FrecencyStore {
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(HISTORY_FILE);
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, path: &str) -> Option<FrecencyEntry> {
        self.entries.lock().expect("frecency lock").get(path).copied()
    }

    pub fn all(&self) -> HashMap<String, FrecencyEntry> {
        self.entries.lock().expect("frecency lock").clone()
    }

    /// Bump an existing entry's rank, or insert a fresh one with rank 1.
    pub fn record_selection(&self, path: &str) -> Result<(), ResolverError> {
        let now = crate::types::unix_now_secs();
        {
            let mut guard = self.entries.lock().expect("frecency lock");
            guard
                .entry(path.to_string())
                .and_modify(|e| {
                    e.rank += 1.0;
                    e.last_accessed = now;
                })
                .or_insert(FrecencyEntry {
                    rank: 1.0,
                    last_accessed: now,
                });
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), ResolverError> {
        let guard = self.entries.lock().expect("frecency lock");
        let data = serde_json::to_vec_pretty(&*guard).map_err(|e| ResolverError::Io(std::io::Error::other(e)))?;
        drop(guard);
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(ResolverError::Io)?;
        std::fs::rename(&tmp, &self.path).map_err(ResolverError::Io)?;
        Ok(())
    }
}

/// Recency multiplier applied to `rank` per spec §4.5: 4x inside an hour,
/// 2x inside a day, 0.5x inside a week, 0.25x otherwise.
fn recency_multiplier(last_accessed: u64, now: u64) -> f64 {
    let age = now.saturating_sub(last_accessed);
    if age < 3600 {
        4.0
    } else if age < 86_400 {
        2.0
    } else if age < 7 * 86_400 {
        0.5
    } else {
        0.25
    }
}

fn is_ignored(basename: &str, ignore: &[String]) -> bool {
    DEFAULT_IGNORED_BASENAMES.contains(&basename) || ignore.iter().any(|i| i == basename)
}

/// Walk from `root` up to `max_depth` levels, treating any directory
/// containing a `.git` entry as a project leaf (do not recurse into it).
fn walk_projects(root: &Path, max_depth: u32, ignore: &[String]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    walk_projects_inner(root, max_depth, ignore, &mut found);
    found
}

fn walk_projects_inner(dir: &Path, depth_remaining: u32, ignore: &[String], found: &mut Vec<PathBuf>) {
    if dir.join(".git").exists() {
        found.push(dir.to_path_buf());
        return;
    }
    if depth_remaining == 0 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if basename.starts_with('.') && basename != ".git" {
            continue;
        }
        if is_ignored(basename, ignore) {
            continue;
        }
        walk_projects_inner(&path, depth_remaining - 1, ignore, found);
    }
}

/// Built-in project resolver: periodic filesystem walk from `$HOME` merged
/// with frecency history.
pub struct BuiltInResolver {
    home: PathBuf,
    frecency: FrecencyStore,
    discovered: Mutex<Vec<PathBuf>>,
    last_scan: Mutex<Option<std::time::Instant>>,
    ignore: Vec<String>,
    max_depth: u32,
}

impl BuiltInResolver {
    pub fn new(home: PathBuf, config_dir: &Path, ignore: Vec<String>, max_depth: u32) -> Self {
        Self {
            home,
            frecency: FrecencyStore::load(config_dir),
            discovered: Mutex::new(Vec::new()),
            last_scan: Mutex::new(None),
            ignore,
            max_depth: max_depth.max(1),
        }
    }

    fn rescan_if_due(&self) {
        let due = {
            let last = self.last_scan.lock().expect("scan lock");
            last.map(|t| t.elapsed() >= RESCAN_INTERVAL).unwrap_or(true)
        };
        if !due {
            return;
        }
        let found = walk_projects(&self.home, self.max_depth, &self.ignore);
        *self.discovered.lock().expect("discovered lock") = found;
        *self.last_scan.lock().expect("scan lock") = Some(std::time::Instant::now());
    }

    pub fn list(&self, query: &str) -> Vec<ProjectEntry> {
        self.rescan_if_due();
        let now = crate::types::unix_now_secs();
        let history = self.frecency.all();
        let discovered = self.discovered.lock().expect("discovered lock").clone();

        let mut candidates: HashMap<String, f64> = HashMap::new();
        for (path, entry) in &history {
            let score = entry.rank * recency_multiplier(entry.last_accessed, now);
            candidates.insert(path.clone(), score);
        }
        for path in &discovered {
            let key = path.to_string_lossy().to_string();
            candidates.entry(key).or_insert(0.1);
        }

        let query_lower = query.to_lowercase();
        let mut entries: Vec<ProjectEntry> = candidates
            .into_iter()
            .filter_map(|(path, score)| {
                let name = Path::new(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.clone());
                if !query_lower.is_empty()
                    && !name.to_lowercase().contains(&query_lower)
                    && !path.to_lowercase().contains(&query_lower)
                {
                    return None;
                }
                Some(ProjectEntry { name, path, score })
            })
            .collect();

        entries.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        entries
    }

    pub fn resolve_one(&self, name: &str) -> Option<ProjectEntry> {
        self.list(name).into_iter().next()
    }

    pub fn record_selection(&self, path: &str) -> Result<(), ResolverError> {
        self.frecency.record_selection(path)
    }
}

/// Resolver backed by an external frecency tool. The tool owns recording;
/// `record_selection` here is a no-op by design.
pub struct ExternalResolver {
    command: String,
}

impl ExternalResolver {
    pub fn new(command: String) -> Self {
        Self { command }
    }

    pub async fn list(&self, query: &str) -> Result<Vec<ProjectEntry>, ResolverError> {
        let output = Command::new(&self.command)
            .arg(query)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ResolverError::ExternalCommand(e.to_string()))?;
        if !output.status.success() {
            return Err(ResolverError::ExternalCommand(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let mut entries = Vec::new();
        for line in text.lines() {
            let mut parts = line.splitn(2, char::is_whitespace);
            let (Some(score_str), Some(path)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(score) = score_str.trim().parse::<f64>() else {
                continue;
            };
            let path = path.trim().to_string();
            let name = Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.clone());
            entries.push(ProjectEntry { name, path, score });
        }
        Ok(entries)
    }

    pub async fn resolve_one(&self, name: &str) -> Result<Option<ProjectEntry>, ResolverError> {
        Ok(self.list(name).await?.into_iter().next())
    }
}

/// Explicit tagged variant over the two resolver strategies (spec §9:
/// "Dynamic dispatch -> explicit variants").
pub enum Resolver {
    BuiltIn(BuiltInResolver),
    External(ExternalResolver),
}

impl Resolver {
    pub async fn list(&self, query: &str) -> Result<Vec<ProjectEntry>, ResolverError> {
        match self {
            Resolver::BuiltIn(r) => Ok(r.list(query)),
            Resolver::External(r) => r.list(query).await,
        }
    }

    pub async fn resolve_one(&self, name: &str) -> Result<Option<ProjectEntry>, ResolverError> {
        match self {
            Resolver::BuiltIn(r) => Ok(r.resolve_one(name)),
            Resolver::External(r) => r.resolve_one(name).await,
        }
    }

    pub fn record_selection(&self, path: &str) -> Result<(), ResolverError> {
        match self {
            Resolver::BuiltIn(r) => r.record_selection(path),
            Resolver::External(_) => {
                warn!(path, "external resolver owns recording; ignoring record_selection");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_multiplier_buckets() {
        let now = 1_000_000;
        assert_eq!(recency_multiplier(now - 100, now), 4.0);
        assert_eq!(recency_multiplier(now - 7200, now), 2.0);
        assert_eq!(recency_multiplier(now - 100_000, now), 0.5);
        assert_eq!(recency_multiplier(now - 1_000_000, now), 0.25);
    }

    #[test]
    fn walk_projects_finds_git_root_and_skips_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let proj = tmp.path().join("proj");
        std::fs::create_dir_all(proj.join(".git")).unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules/sub")).unwrap();

        let found = walk_projects(tmp.path(), DEFAULT_MAX_DEPTH, &[]);
        assert_eq!(found, vec![proj]);
    }

    #[test]
    fn walk_projects_does_not_recurse_into_project_root() {
        let tmp = tempfile::tempdir().unwrap();
        let proj = tmp.path().join("proj");
        std::fs::create_dir_all(proj.join(".git")).unwrap();
        std::fs::create_dir_all(proj.join("nested").join(".git")).unwrap();

        let found = walk_projects(tmp.path(), DEFAULT_MAX_DEPTH, &[]);
        assert_eq!(found, vec![proj]);
    }

    #[test]
    fn frecency_store_records_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FrecencyStore::load(tmp.path());
        store.record_selection("/a/b").unwrap();
        assert_eq!(store.get("/a/b").unwrap().rank, 1.0);
        store.record_selection("/a/b").unwrap();
        assert_eq!(store.get("/a/b").unwrap().rank, 2.0);

        let reloaded = FrecencyStore::load(tmp.path());
        assert_eq!(reloaded.get("/a/b").unwrap().rank, 2.0);
    }

    #[test]
    fn list_filters_by_case_insensitive_substring() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = BuiltInResolver::new(tmp.path().to_path_buf(), tmp.path(), vec![], DEFAULT_MAX_DEPTH);
        resolver.record_selection("/home/u/Acme").unwrap();
        let results = resolver.list("acme");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Acme");
    }
}
