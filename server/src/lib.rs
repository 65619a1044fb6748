//! MuxTunnel gateway: HTTP/JSON RPC, WebSocket PTY stream, static assets,
//! and the multiplexer hook endpoint. Service wiring lives here so the
//! binary entry point (`main.rs`) stays a thin bootstrap, same split the
//! teacher used between `lib.rs` and `web_server.rs`.

pub mod gateway;

use muxtunnel_core::config::Config;
use muxtunnel_core::mux::MuxAdapter;
use muxtunnel_core::order::OrderStore;
use muxtunnel_core::pty::PtyRegistry;
use muxtunnel_core::resolver::{BuiltInResolver, ExternalResolver, Resolver};
use muxtunnel_core::settings::SettingsStore;
use muxtunnel_core::watcher::AssistantWatcher;
use std::sync::Arc;
use tracing::{error, warn};

/// Gather every process-wide component into one place and build the
/// router (spec §9: "gather into a single service struct constructed at
/// startup and torn down on SIGINT/SIGTERM").
pub async fn build_app(config: &'static Config) -> Result<(axum::Router, gateway::AppState), Box<dyn std::error::Error + Send + Sync>> {
    let mux = Arc::new(MuxAdapter::new());
    let pty = PtyRegistry::default();
    let watcher = AssistantWatcher::new(config.home.clone());
    let order = Arc::new(OrderStore::load(&config.config_dir));
    let settings_store = SettingsStore::init(config.config_dir.clone())?;

    let (settings, _) = settings_store.get();
    let resolver = Arc::new(if settings.resolver == "projects" {
        Resolver::BuiltIn(BuiltInResolver::new(
            config.home.clone(),
            &config.config_dir,
            settings.projects.ignore.clone(),
            settings.projects.max_depth,
        ))
    } else {
        Resolver::External(ExternalResolver::new(settings.resolver.clone()))
    });

    let state = gateway::AppState::new(
        mux,
        pty,
        watcher.clone(),
        resolver,
        settings_store.clone(),
        order,
        config.static_dir.clone(),
    );

    let callback_url = format!("http://{}:{}/api/internal/session-changed", config.host, config.port);
    if let Err(e) = state.mux.install_session_changed_hook(&callback_url).await {
        warn!(error = %e, "failed to install multiplexer hook; session-changed notifications will not arrive");
    }

    tokio::spawn({
        let watcher = watcher.clone();
        async move {
            if let Err(e) = watcher.watch().await {
                error!(error = %e, "assistant transcript watcher failed to start");
            }
        }
    });
    tokio::spawn({
        let settings_store = settings_store.clone();
        async move {
            if let Err(e) = settings_store.watch().await {
                error!(error = %e, "settings file watcher failed to start");
            }
        }
    });

    let router = gateway::build_router(state.clone());
    Ok((router, state))
}

/// Uninstall the multiplexer hook before the process exits, so a lingering
/// multiplexer server doesn't keep curling a dead gateway (spec §9).
pub async fn teardown(state: &gateway::AppState) {
    if let Err(e) = state.mux.uninstall_session_changed_hook().await {
        warn!(error = %e, "failed to uninstall multiplexer hook during shutdown");
    }
}
