use anyhow::Context;
use tracing::{info, warn};

use cookiebridge_core::bootstrap_from_env;
use cookiebridge_router::app_router;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("cookiebridge failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let boot = bootstrap_from_env().await?;
    let state = boot.state;
    let bind = {
        let config = state.config();
        info!(
            host = %config.host,
            port = config.port,
            upstream = %config.upstream,
            credential_dir = %config.credential_dir,
            proxy = %config.proxy.as_deref().unwrap_or(""),
            "config loaded"
        );
        format!("{}:{}", config.host, config.port)
    };

    let app = app_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    if let Err(err) = state.session.close().await {
        warn!(error = %err, "upstream session close failed");
    }
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
