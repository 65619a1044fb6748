//! Settings Store: a versioned, hot-reloadable settings record built from a
//! single source-of-truth schema (spec §4.6). The schema drives three
//! things: the default record, the generated `defaults.jsonc` documentation
//! file, and override parsing (accepting either nested or flat dot-notation
//! JSON).

use crate::error::SettingsError;
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SETTINGS_FILE: &str = "settings.json";
const DEFAULTS_FILE: &str = "defaults.jsonc";
const DEBOUNCE_MS: u64 = 300;

/// One entry in the source-of-truth schema: a flat dot-notation key, its
/// default JSON value, and a human description for `defaults.jsonc`.
pub struct SettingSpec {
    pub key: &'static str,
    pub default: fn() -> Value,
    pub description: &'static str,
}

pub const SETTINGS_SCHEMA: &[SettingSpec] = &[
    SettingSpec { key: "resolver", default: || Value::String("projects".into()), description: "Project resolver strategy: \"projects\" (built-in) or an external tool name." },
    SettingSpec { key: "projects.ignore", default: || Value::Array(vec![]), description: "Additional basenames to skip during project discovery." },
    SettingSpec { key: "projects.maxDepth", default: || Value::from(3), description: "Maximum directory depth walked from $HOME during project discovery." },
    SettingSpec { key: "background.image", default: || Value::Null, description: "Path to a background image, or null for none." },
    SettingSpec { key: "background.size", default: || Value::String("cover".into()), description: "CSS background-size keyword." },
    SettingSpec { key: "background.opacity", default: || Value::from(0.15), description: "Background image opacity, 0.0 to 1.0." },
    SettingSpec { key: "background.filter", default: || Value::Null, description: "CSS filter applied to the background image." },
    SettingSpec { key: "terminal.fontSize", default: || Value::from(14), description: "Terminal font size in pixels." },
    SettingSpec { key: "terminal.fontFamily", default: || Value::String("monospace".into()), description: "Terminal font family." },
    SettingSpec { key: "window.padding", default: || Value::from(0), description: "Padding in pixels around the terminal surface." },
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectsSettings {
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(rename = "maxDepth", default = "default_max_depth")]
    pub max_depth: u32,
}

fn default_max_depth() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundSettings {
    pub image: Option<String>,
    pub size: String,
    pub opacity: f64,
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    #[serde(rename = "fontSize")]
    pub font_size: u32,
    #[serde(rename = "fontFamily")]
    pub font_family: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSettings {
    pub padding: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub resolver: String,
    pub projects: ProjectsSettings,
    pub background: BackgroundSettings,
    pub terminal: TerminalSettings,
    pub window: WindowSettings,
}

impl Settings {
    fn defaults() -> Self {
        let merged = default_tree();
        serde_json::from_value(merged).expect("schema defaults must deserialize into Settings")
    }

    /// Clamp numeric ranges named in the schema (maxDepth >= 1, opacity in
    /// [0,1], padding >= 0).
    fn clamp(mut self) -> Self {
        if self.projects.max_depth < 1 {
            self.projects.max_depth = 1;
        }
        self.background.opacity = self.background.opacity.clamp(0.0, 1.0);
        self
    }
}

/// Build the nested default JSON tree by walking the flat schema and
/// splitting each key on `.`.
fn default_tree() -> Value {
    let mut root = Value::Object(serde_json::Map::new());
    for spec in SETTINGS_SCHEMA {
        set_by_path(&mut root, spec.key, (spec.default)());
    }
    root
}

fn set_by_path(root: &mut Value, dotted_key: &str, value: Value) {
    let segments: Vec<&str> = dotted_key.split('.').collect();
    let mut current = root;
    for (i, seg) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let obj = current.as_object_mut().expect("just ensured object");
        if i == segments.len() - 1 {
            obj.insert((*seg).to_string(), value.clone());
            return;
        }
        current = obj.entry((*seg).to_string()).or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Deep-merge `overrides` onto `base`, accepting either nested JSON or a
/// flat dot-notation object (`{"terminal.fontSize": 16}`).
fn merge_overrides(base: &mut Value, overrides: &Value) {
    let Some(obj) = overrides.as_object() else {
        return;
    };
    for (key, value) in obj {
        if key.contains('.') {
            set_by_path(base, key, value.clone());
            continue;
        }
        match (base.get_mut(key), value) {
            (Some(existing @ Value::Object(_)), Value::Object(_)) => {
                merge_overrides(existing, value);
            }
            _ => {
                if !base.is_object() {
                    *base = Value::Object(serde_json::Map::new());
                }
                base.as_object_mut()
                    .expect("just ensured object")
                    .insert(key.clone(), value.clone());
            }
        }
    }
}

/// Render `defaults.jsonc`: every schema key on its own line, preceded by a
/// `// description` comment, nested by dot-segment.
fn render_defaults_jsonc() -> String {
    let mut out = String::new();
    out.push_str("// Generated on every startup. Edit settings.json instead — this file is documentation only.\n");
    out.push_str("{\n");
    let mut last_prefix: Vec<&str> = Vec::new();
    for spec in SETTINGS_SCHEMA {
        let segments: Vec<&str> = spec.key.split('.').collect();
        let (leaf, prefix) = segments.split_last().unwrap();
        // Close/open braces for nested groups when the prefix changes.
        if prefix != last_prefix.as_slice() {
            last_prefix = prefix.to_vec();
        }
        let indent = "  ".repeat(prefix.len() + 1);
        out.push_str(&format!("{indent}// {}\n", spec.description));
        let value = (spec.default)();
        let rendered = serde_json::to_string(&value).unwrap_or_default();
        let dotted_path = prefix
            .iter()
            .chain(std::iter::once(leaf))
            .cloned()
            .collect::<Vec<_>>()
            .join(".");
        out.push_str(&format!("{indent}// {dotted_path} = {rendered}\n"));
    }
    out.push_str("}\n");
    out
}

fn load_overrides(path: &Path) -> Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}

struct Inner {
    settings: Settings,
    version: u64,
}

/// Versioned settings record backed by `settings.json` in the config dir.
/// Consumers poll `get()` and compare `version` to detect reloads.
#[derive(Clone)]
pub struct SettingsStore {
    config_dir: Arc<PathBuf>,
    inner: Arc<RwLock<Inner>>,
}

impl SettingsStore {
    /// Load current overrides (if any), write `defaults.jsonc`, and return
    /// a ready store. Read errors on `settings.json` fall back to defaults.
    pub fn init(config_dir: PathBuf) -> Result<Self, SettingsError> {
        std::fs::create_dir_all(&config_dir).map_err(SettingsError::Io)?;
        std::fs::write(config_dir.join(DEFAULTS_FILE), render_defaults_jsonc()).map_err(SettingsError::Io)?;

        let settings = Self::load_from_disk(&config_dir);
        Ok(Self {
            config_dir: Arc::new(config_dir),
            inner: Arc::new(RwLock::new(Inner { settings, version: 1 })),
        })
    }

    fn load_from_disk(config_dir: &Path) -> Settings {
        let mut merged = default_tree();
        let overrides = load_overrides(&config_dir.join(SETTINGS_FILE));
        merge_overrides(&mut merged, &overrides);
        serde_json::from_value(merged)
            .map(Settings::clamp)
            .unwrap_or_else(|e| {
                warn!(error = %e, "malformed settings.json, falling back to defaults");
                Settings::defaults()
            })
    }

    pub fn get(&self) -> (Settings, u64) {
        let guard = self.inner.read().expect("settings read lock");
        (guard.settings.clone(), guard.version)
    }

    fn reload(&self) {
        let settings = Self::load_from_disk(&self.config_dir);
        let mut guard = self.inner.write().expect("settings write lock");
        guard.version += 1;
        guard.settings = settings;
        debug!(version = guard.version, "settings reloaded");
    }

    /// Watch `settings.json` for changes, debounced 300 ms, bumping
    /// `version` on every reload. Runs forever on a spawned task.
    pub async fn watch(self) -> Result<(), SettingsError> {
        let (tx, mut rx) = mpsc::channel::<notify::Event>(256);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.try_send(event);
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_millis(500)),
        )
        .map_err(SettingsError::Watch)?;

        watcher
            .watch(&self.config_dir, RecursiveMode::NonRecursive)
            .map_err(SettingsError::Watch)?;

        let store = self;
        tokio::spawn(async move {
            let _watcher = watcher;
            let debounce = tokio::time::sleep(Duration::from_secs(3600));
            tokio::pin!(debounce);
            let mut dirty = false;
            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        let touches_settings = event.paths.iter().any(|p| p.file_name().map(|n| n == SETTINGS_FILE).unwrap_or(false));
                        if !touches_settings || !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            continue;
                        }
                        dirty = true;
                        debounce.as_mut().reset(tokio::time::Instant::now() + Duration::from_millis(DEBOUNCE_MS));
                    }
                    _ = &mut debounce => {
                        if dirty {
                            store.reload();
                            dirty = false;
                        }
                        debounce.as_mut().reset(tokio::time::Instant::now() + Duration::from_secs(3600));
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_schema() {
        let settings = Settings::defaults();
        assert_eq!(settings.resolver, "projects");
        assert_eq!(settings.projects.max_depth, 3);
        assert_eq!(settings.terminal.font_size, 14);
    }

    #[test]
    fn flat_dot_override_applies_over_nested_default() {
        let mut base = default_tree();
        let overrides: Value = serde_json::from_str(r#"{"terminal.fontSize": 18}"#).unwrap();
        merge_overrides(&mut base, &overrides);
        let settings: Settings = serde_json::from_value(base).unwrap();
        assert_eq!(settings.terminal.font_size, 18);
        assert_eq!(settings.terminal.font_family, "monospace");
    }

    #[test]
    fn nested_override_deep_merges() {
        let mut base = default_tree();
        let overrides: Value = serde_json::from_str(r#"{"background": {"opacity": 0.5}}"#).unwrap();
        merge_overrides(&mut base, &overrides);
        let settings: Settings = serde_json::from_value(base).unwrap();
        assert_eq!(settings.background.opacity, 0.5);
        assert_eq!(settings.background.size, "cover");
    }

    #[test]
    fn clamp_rejects_out_of_range_values() {
        let mut settings = Settings::defaults();
        settings.projects.max_depth = 0;
        settings.background.opacity = 5.0;
        let clamped = settings.clamp();
        assert_eq!(clamped.projects.max_depth, 1);
        assert_eq!(clamped.background.opacity, 1.0);
    }

    #[test]
    fn version_strictly_increases_on_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SettingsStore::init(tmp.path().to_path_buf()).unwrap();
        let (_, v1) = store.get();
        store.reload();
        let (_, v2) = store.get();
        assert!(v2 > v1);
    }

    #[test]
    fn unchanged_file_rewrite_keeps_same_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SettingsStore::init(tmp.path().to_path_buf()).unwrap();
        let (before, _) = store.get();
        std::fs::write(tmp.path().join(SETTINGS_FILE), "{}").unwrap();
        store.reload();
        let (after, v2) = store.get();
        assert_eq!(before.terminal.font_size, after.terminal.font_size);
        assert!(v2 >= 2);
    }

    #[test]
    fn defaults_jsonc_documents_every_schema_key() {
        let rendered = render_defaults_jsonc();
        for spec in SETTINGS_SCHEMA {
            assert!(rendered.contains(spec.key), "missing {}", spec.key);
        }
    }
}
