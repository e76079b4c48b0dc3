use std::sync::Arc;

use harness::admission::AdmissionRegistry;
use harness::config::HarnessConfig;
use harness::http::{self, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(HarnessConfig::from_env());
    let registry = AdmissionRegistry::new();
    let bind_addr = format!("{}:{}", config.bind_host, config.bind_port);

    tracing::info!(
        bind = %bind_addr,
        workspace_root = %config.workspace_root.display(),
        "starting harness-orchestrator"
    );

    let app = http::build_router(AppState::new(config, registry));

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {bind_addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}
