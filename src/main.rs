use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use contained::config::{Config, LogFormat};
use contained::engine::{DockerEngine, EnginePool};
use contained::profiles::ProfileRegistry;
use contained::server::frontend::render_index_page;
use contained::server::{AppState, Server, ServerConfig};
use contained::session::SessionEndpoint;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::parse();
    init_tracing(&config);

    config.validate()?;

    let registry = ProfileRegistry::builtin()?;
    registry.verify()?;
    tracing::debug!(
        profiles = ?registry.names().collect::<Vec<_>>(),
        "Loaded security profiles"
    );

    if let Err(e) = render_index_page(&config.frontend, &config.host_os) {
        tracing::warn!(dir = %config.frontend.display(), "Rendering index page failed: {}", e);
    }

    let standard = DockerEngine::connect(&config.standard_endpoint()?)
        .context("creating docker client")?;
    let namespaced = DockerEngine::connect(&config.namespaced_endpoint()?)
        .context("creating user namespace enabled docker client")?;
    tracing::info!(
        standard = %config.docker_host,
        namespaced = %config.docker_userns_host,
        tls = config.tls()?.is_some(),
        "Engine clients ready"
    );

    let sessions = SessionEndpoint::new(
        Arc::new(registry),
        EnginePool::new(Arc::new(standard), Arc::new(namespaced)),
    );
    let mut server = Server::new(
        ServerConfig {
            addr: config.listen_addr(),
            frontend_dir: Some(config.frontend.clone()),
        },
        AppState { sessions },
    );
    server.start().await?;

    shutdown_signal().await;
    tracing::info!("Shutting down...");
    server.shutdown().await;
    tracing::info!("Stopped.");
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_directive = if config.debug {
        "contained=debug,tower_http=debug"
    } else {
        "contained=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().with_current_span(true).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Listening for Ctrl-C failed: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Listening for SIGTERM failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
