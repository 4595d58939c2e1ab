use anyhow::{anyhow, Context, Result};
use axum::serve;
use proxyd_core::{
    config::{AppConfig, LoggingConfig},
    runtime::ProxydRuntime,
};
use rustls::crypto::{ring::default_provider, CryptoProvider};
use server::{create_metrics_router, create_router, AppState, WsServer};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal, sync::broadcast, task::JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Graceful shutdown timeout in seconds.
/// Servers still draining after this are abandoned and the runtime is shut down.
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

fn default_filter(level: &str) -> String {
    format!("warn,proxyd_core={level},server={level},proxyd={level}")
}

/// Initializes logging. `RUST_LOG` takes precedence over `[logging] level`.
fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

async fn bind(name: &str, addr: &str) -> Result<TcpListener> {
    let listener =
        TcpListener::bind(addr).await.with_context(|| format!("failed to bind {name} listener on {addr}"))?;
    info!(address = %addr, "{name} server listening");
    Ok(listener)
}

#[tokio::main]
async fn main() -> Result<()> {
    CryptoProvider::install_default(default_provider())
        .map_err(|e| anyhow!("failed to install crypto provider: {e:?}"))?;

    let config_path = std::env::args().nth(1);
    let config = AppConfig::load(config_path.as_deref()).context("failed to load configuration")?;
    init_logging(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "starting proxyd");

    let runtime = ProxydRuntime::builder()
        .with_config(config)
        .enable_lvc_poller()
        .build()
        .await
        .context("failed to initialize proxyd")?;
    let config = runtime.config().clone();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut servers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let listener = bind("rpc", &config.rpc_addr()).await?;
    let app = create_router(AppState::from_runtime(&runtime), config.server.max_concurrent_requests);
    let mut rpc_shutdown = shutdown_tx.subscribe();
    servers.push((
        "rpc",
        tokio::spawn(async move {
            let result = serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = rpc_shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "rpc server error occurred");
            }
        }),
    ));

    if let Some(ws_addr) = config.ws_addr() {
        match WsServer::from_runtime(&runtime) {
            Some(ws_server) => {
                let listener = bind("websocket", &ws_addr).await?;
                let task = Arc::new(ws_server).serve(listener, shutdown_tx.subscribe());
                servers.push(("websocket", tokio::spawn(task)));
            }
            None => warn!("ws_port is set but no backend group serves websocket clients"),
        }
    }

    if config.metrics.enabled {
        let listener = bind("metrics", &config.metrics_addr()).await?;
        let app = create_metrics_router(runtime.components().metrics_collector().clone());
        let mut metrics_shutdown = shutdown_tx.subscribe();
        servers.push((
            "metrics",
            tokio::spawn(async move {
                let result = serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = metrics_shutdown.recv().await;
                    })
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "metrics server error occurred");
                }
            }),
        ));
    }

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    let drain = async {
        for (name, server) in servers {
            if let Err(e) = server.await {
                error!(server = name, error = %e, "server task failed");
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS), drain).await.is_err() {
        warn!(timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT_SECS, "servers did not drain in time");
    }

    runtime.shutdown().await;
    info!("server shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");

                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(
        "shutdown signal received, starting graceful shutdown (timeout: {}s)",
        GRACEFUL_SHUTDOWN_TIMEOUT_SECS
    );
}
