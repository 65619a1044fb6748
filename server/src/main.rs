//! Standalone MuxTunnel gateway binary. Reads `PORT`/`HOST`/`STATIC_DIR`
//! from the environment (see `muxtunnel_core::config`) and serves until
//! SIGINT/SIGTERM.

use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = muxtunnel_core::config::ensure_loaded();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let (router, state) = muxtunnel_server::build_app(config).await?;

        info!(host = %config.host, port = config.port, "muxtunnel gateway starting");
        let mut serve_task = tokio::spawn(muxtunnel_server::gateway::serve(router, &config.host, config.port));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
            }
            result = &mut serve_task => {
                if let Ok(Err(e)) = result {
                    tracing::error!(error = %e, "gateway accept loop exited with an error");
                }
            }
        }
        serve_task.abort();

        muxtunnel_server::teardown(&state).await;
        Ok(())
    })
}
