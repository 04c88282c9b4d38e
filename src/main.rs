use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trafficmirror::config::{Cli, ProxyConfig};
use trafficmirror::error::MirrorError;
use trafficmirror::mirror::{ReqwestOutboundClient, MIRROR_CLIENT_TIMEOUT};
use trafficmirror::proxy::{mirror_router, targets_router, AppState};
use trafficmirror::reflector::{MirrorSettings, Reflector};
use trafficmirror::tracker::RequestTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ProxyConfig::from_cli(cli).context("invalid configuration")?;
    init_logging(&config);

    print_usage(&config);

    let client = Arc::new(ReqwestOutboundClient::new().map_err(MirrorError::HttpClient)?);
    let settings = MirrorSettings {
        max_queued_requests: config.max_queued_requests,
        persistent_failure_timeout: config.persistent_failure_timeout,
        retry_after: config.retry_after,
    };
    let reflector = Reflector::new(settings, client);
    if !config.initial_mirrors.is_empty() {
        reflector.add_mirrors(&config.initial_mirrors, true);
    }

    let shutdown = CancellationToken::new();
    let reflector_task = tokio::spawn(reflector.clone().run());

    let primary_client = reqwest::Client::builder()
        .timeout(MIRROR_CLIENT_TIMEOUT)
        .build()
        .map_err(MirrorError::HttpClient)?;

    let state = AppState {
        reflector: reflector.clone(),
        tracker: Arc::new(RequestTracker::new()),
        primary_client,
        primary_target: config.main_target.clone(),
        primary_delay: config.main_target_delay,
        credentials: config.credentials.clone().map(Arc::new),
        targets_endpoint: config.targets_endpoint.clone(),
        max_body_bytes: config.max_body_bytes,
    };

    let mirror_addr = normalize_addr(&config.listen);
    let mirror_listener = tokio::net::TcpListener::bind(mirror_addr.as_str())
        .await
        .map_err(|source| MirrorError::Bind {
            addr: mirror_addr.clone(),
            source,
        })?;

    let mut server_tasks = Vec::new();

    if let Some(targets_address) = &config.targets_address {
        let targets_addr = normalize_addr(targets_address);
        let targets_listener = tokio::net::TcpListener::bind(targets_addr.as_str())
            .await
            .map_err(|source| MirrorError::Bind {
                addr: targets_addr.clone(),
                source,
            })?;
        let router = mirror_router(state.clone(), false);
        let targets_router = targets_router(state.clone());
        let mirror_shutdown = shutdown.clone();
        server_tasks.push(tokio::spawn(async move {
            axum::serve(mirror_listener, router)
                .with_graceful_shutdown(async move { mirror_shutdown.cancelled().await })
                .await
        }));
        let targets_shutdown = shutdown.clone();
        server_tasks.push(tokio::spawn(async move {
            axum::serve(targets_listener, targets_router)
                .with_graceful_shutdown(async move { targets_shutdown.cancelled().await })
                .await
        }));
    } else {
        let router = mirror_router(state.clone(), true);
        let mirror_shutdown = shutdown.clone();
        server_tasks.push(tokio::spawn(async move {
            axum::serve(mirror_listener, router)
                .with_graceful_shutdown(async move { mirror_shutdown.cancelled().await })
                .await
        }));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, exiting");
    shutdown.cancel();

    for task in server_tasks {
        let _ = task.await;
    }
    reflector_task.abort();

    Ok(())
}

/// `:8080`-style addresses bind all interfaces in Go's `net.Listen`; map the
/// same shorthand onto an explicit `0.0.0.0` for `tokio::net::TcpListener`.
fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

fn init_logging(config: &ProxyConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_usage(config: &ProxyConfig) {
    let targets_text = match &config.targets_address {
        Some(addr) => format!("http://{addr}/{}", config.targets_endpoint),
        None => format!("http://{}/{}", config.listen, config.targets_endpoint),
    };
    println!("Add/remove/list mirror targets via PUT/DELETE/GET at {targets_text}:");
    println!("List  : curl {targets_text}");
    println!("Add   : curl -X PUT {targets_text}?url=http://localhost:5678");
    println!("Remove: curl -X DELETE {targets_text}?url=http://localhost:5678");
    println!();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
