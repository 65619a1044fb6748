//! Bootstrap config: read once from the environment at process start. This
//! is distinct from the hot-reloadable `SettingsStore` in `settings.rs` —
//! `PORT`/`HOST`/`STATIC_DIR` never change for the life of the process, so
//! they're loaded once into a `OnceLock` the same way the teacher caches
//! its settings singleton.

use std::path::PathBuf;
use std::sync::OnceLock;

const DEFAULT_PORT: u16 = 3002;
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_STATIC_DIR: &str = "web/dist";
const CONFIG_DIR_NAME: &str = "muxtunnel";

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Environment-derived process configuration.
pub struct Config {
    pub port: u16,
    pub host: String,
    pub static_dir: PathBuf,
    /// `$HOME/.config/muxtunnel` (or platform equivalent) — where
    /// `settings.json`, `defaults.jsonc`, `session-order.json`, and
    /// `history.json` live.
    pub config_dir: PathBuf,
    pub home: PathBuf,
}

/// Load config from the environment (idempotent): the first caller does
/// the work, later callers get the same instance.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(load_from_env)
}

fn load_from_env() -> Config {
    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let host = std::env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let static_dir = std::env::var("STATIC_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATIC_DIR));
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    let config_dir = dirs::config_dir()
        .map(|d| d.join(CONFIG_DIR_NAME))
        .unwrap_or_else(|| home.join(format!(".{CONFIG_DIR_NAME}")));

    Config {
        port,
        host,
        static_dir,
        config_dir,
        home,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_from_env_falls_back_to_defaults_when_unset() {
        // Isolated from ensure_loaded's OnceLock on purpose: exercises the
        // free function so the test doesn't depend on call order with
        // other tests that might have already initialized CONFIG.
        std::env::remove_var("PORT");
        std::env::remove_var("HOST");
        std::env::remove_var("STATIC_DIR");
        let cfg = load_from_env();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.host, DEFAULT_HOST);
        assert_eq!(cfg.static_dir, PathBuf::from(DEFAULT_STATIC_DIR));
    }
}
