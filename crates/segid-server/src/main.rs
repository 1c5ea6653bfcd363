#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use core::time::Duration;
use segid::{Manager, SqlStore};
use server::config::{CliArgs, ServerConfig};
use server::resp::handler::CommandHandler;
use server::telemetry::init_telemetry;
use server::{http, resp};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let store = Arc::new(SqlStore::connect(config.connect_options()).await?);
    let manager = Arc::new(Manager::new(Arc::clone(&store), config.manager_config()));
    manager.init().await?;

    let resp_listener = TcpListener::bind(&config.server_addr).await?;
    let http_listener = match &config.http_addr {
        Some(addr) => Some(TcpListener::bind(addr).await?),
        None => None,
    };
    log_startup_info(&config, manager.list_services().await.len());

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let resp_server = resp::listener::serve(
        resp_listener,
        Arc::new(CommandHandler::new(Arc::clone(&manager))),
        shutdown.clone(),
        config.shutdown_timeout,
    );
    let http_server = serve_http(
        http_listener,
        http::router(Arc::clone(&manager)),
        shutdown.clone(),
        config.shutdown_timeout,
    );

    let ((), http_result) = tokio::join!(resp_server, http_server);

    if let Err(_e) = store.close().await {
        #[cfg(feature = "tracing")]
        tracing::error!("Error closing the store: {:?}", _e);
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");

    providers.shutdown();
    http_result?;
    Ok(())
}

async fn serve_http(
    listener: Option<TcpListener>,
    router: axum::Router,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> std::io::Result<()> {
    let Some(listener) = listener else {
        return Ok(());
    };

    let serve = http::serve(listener, router, shutdown.clone());
    let deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(drain_timeout).await;
    };

    tokio::select! {
        result = serve => result,
        () = deadline => {
            #[cfg(feature = "tracing")]
            tracing::warn!("HTTP drain timed out");
            Ok(())
        }
    }
}

fn log_startup_info(_config: &ServerConfig, _services: usize) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting ID service on {} with {} services and full config: {:#?}",
            _config.server_addr,
            _services,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting ID service on {} (http: {}) with {} services, batch size {}",
            _config.server_addr,
            _config.http_addr.as_deref().unwrap_or("disabled"),
            _services,
            _config.batch_size
        );
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");

    shutdown.cancel();
}
