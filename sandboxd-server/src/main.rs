mod error;
mod handlers;
mod progress;
mod routes;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sandboxd::backend::BackendRegistry;
use sandboxd::config::ServiceConfig;
use sandboxd::service::BoxService;

#[derive(Parser, Debug)]
#[command(name = "sandboxd-server", about = "HTTP control plane for sandbox boxes")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:28080")]
    listen: String,

    /// Force debug-level logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServiceConfig::from_env()?;

    let level = if cli.debug {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    // Explicit registry, populated here: no module-initialization magic.
    let registry = BackendRegistry::with_defaults();
    tracing::info!(mode = %config.mode, namespace = %config.namespace, "starting sandboxd");
    let service = Arc::new(BoxService::new(&registry, config).await?);

    let app = routes::router(Arc::clone(&service));
    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "sandboxd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    service.close().await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
