//! culvert-server: public edge of the culvert HTTP tunnel.
//!
//! Runs three listeners: plain HTTP for ACME challenges and redirects,
//! public HTTPS for tunnel traffic, and the TLS control-channel listener
//! clients register on.

mod autocert;
mod config;
mod control;
mod ingress;
mod mux;
mod registry;

use autocert::CertManager;
use clap::Parser;
use config::{parse_domains, ServerConfig};
use mux::TunnelMux;
use registry::TunnelRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// culvert-server — self-hosted HTTP tunnel server
#[derive(Parser, Debug)]
#[command(name = "culvert-server", version, about = "Self-hosted HTTP tunnel server")]
struct Cli {
    /// Plain HTTP listener port (ACME challenges & redirects)
    #[arg(long, env = "SERVER_HTTP_PORT", default_value_t = 80)]
    http_port: u16,

    /// Public HTTPS listener port (tunnel traffic)
    #[arg(long, env = "SERVER_HTTPS_PORT", default_value_t = 443)]
    https_port: u16,

    /// Control channel listener port (WebSocket upgrade at /tunnel)
    #[arg(long, env = "SERVER_WS_PORT", default_value_t = 4443)]
    ws_port: u16,

    /// Comma-separated hostnames permitted in the TLS host policy
    #[arg(long, env = "AUTOCERT_DOMAINS")]
    autocert_domains: String,

    /// Contact email passed to the certificate collaborator
    #[arg(long, env = "AUTOCERT_EMAIL")]
    autocert_email: Option<String>,

    /// Certificate cache directory
    #[arg(long, env = "AUTOCERT_CACHE_DIR", default_value = "/var/lib/autocert")]
    autocert_cache_dir: PathBuf,

    /// Maximum accepted request body size in bytes (0 = unbounded)
    #[arg(long, env = "SERVER_MAX_BODY_BYTES", default_value_t = 0)]
    max_body_bytes: u64,

    /// Seconds to wait for a tunneled response
    #[arg(long, env = "SERVER_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    /// Seconds allowed for in-flight requests to drain on shutdown
    #[arg(long, env = "SERVER_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    shutdown_grace_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let domains = parse_domains(&cli.autocert_domains);
    if domains.is_empty() {
        error!("AUTOCERT_DOMAINS must name at least one hostname");
        std::process::exit(1);
    }

    let config = ServerConfig {
        http_port: cli.http_port,
        https_port: cli.https_port,
        ws_port: cli.ws_port,
        domains,
        autocert_email: cli.autocert_email,
        autocert_cache_dir: cli.autocert_cache_dir,
        max_body_bytes: cli.max_body_bytes,
        request_timeout: Duration::from_secs(cli.request_timeout_secs),
        shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        domains = ?config.domains,
        cache_dir = %config.autocert_cache_dir.display(),
        "starting culvert-server"
    );

    let cert_manager = Arc::new(CertManager::new(
        config.domains.clone(),
        config.autocert_email.clone(),
        config.autocert_cache_dir.clone(),
    ));
    info!(
        email = cert_manager.email().unwrap_or("<none>"),
        "certificate collaborator ready"
    );
    let registry = Arc::new(TunnelRegistry::new());
    let mux = Arc::new(TunnelMux::new(registry, config.request_timeout));

    let http_listener = bind(config.http_port).await;
    let https_listener = bind(config.https_port).await;
    let ws_listener = bind(config.ws_port).await;

    let tls = TlsAcceptor::from(cert_manager.tls_config());
    let tracker = TaskTracker::new();
    let shutdown = CancellationToken::new();

    tracker.spawn(autocert::serve_http(
        http_listener,
        cert_manager.clone(),
        tracker.clone(),
        shutdown.clone(),
    ));
    tracker.spawn(ingress::serve(
        https_listener,
        tls.clone(),
        mux.clone(),
        config.max_body_bytes,
        tracker.clone(),
        shutdown.clone(),
    ));
    tracker.spawn(control::serve(
        ws_listener,
        tls,
        mux.clone(),
        tracker.clone(),
        shutdown.clone(),
    ));

    // Periodic status line for operators.
    {
        let mux = mux.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let active = mux.registry().count().await;
                        let domains = mux.registry().list().await;
                        let pending = mux.pending_count().await;
                        debug!(
                            active,
                            domains = ?domains,
                            pending,
                            "tunnel status"
                        );
                    }
                }
            }
        });
    }

    info!(
        http_port = config.http_port,
        https_port = config.https_port,
        ws_port = config.ws_port,
        "culvert-server ready"
    );

    shutdown_signal().await;
    info!("shutting down gracefully");
    shutdown.cancel();
    tracker.close();

    if tokio::time::timeout(config.shutdown_grace, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            pending = mux.pending_count().await,
            "grace period elapsed with connections still draining"
        );
    }

    info!("server stopped");
}

async fn bind(port: u16) -> TcpListener {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port, error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
