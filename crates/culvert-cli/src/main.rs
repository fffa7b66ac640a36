//! culvert — expose a local HTTP server at a public domain.
//!
//! `culvert config --server tunnel.example.com` persists the server once;
//! `culvert --url dev.example.com 3000` then tunnels the public domain to
//! `127.0.0.1:3000` until interrupted or disconnected.

mod config;

use clap::{Parser, Subcommand};
use config::Config;
use culvert_client::TunnelClient;
use tracing::{error, info};

/// culvert — self-hosted HTTP tunnel client
#[derive(Parser)]
#[command(
    name = "culvert",
    version,
    about = "Expose a local HTTP server at a public, TLS-terminated domain"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Public domain for the tunnel
    #[arg(long, value_name = "DOMAIN")]
    url: Option<String>,

    /// Local port to forward to (127.0.0.1:<PORT>)
    #[arg(value_name = "PORT")]
    port: Option<u16>,

    /// Rewrite the Host header to the loopback authority
    #[arg(long)]
    rewrite_host: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Persist client settings
    Config {
        /// Tunnel server hostname (e.g. tunnel.example.com)
        #[arg(long)]
        server: String,
    },
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

    match cli.command {
        Some(Command::Config { server }) => {
            let config = Config::new(server);
            if let Err(e) = config.save() {
                eprintln!("culvert: failed to save config: {e:#}");
                std::process::exit(1);
            }
            println!("Configuration saved to {}", Config::path().display());
            println!("Server: {}", config.server);
            println!("Control channel: {}", config.ws_url());
        }
        None => {
            let (Some(domain), Some(port)) = (cli.url, cli.port) else {
                eprintln!(
                    "Usage:\n  culvert config --server DOMAIN    Configure server settings\n  culvert --url DOMAIN PORT         Create HTTP tunnel\n\nExamples:\n  culvert config --server tunnel.example.com\n  culvert --url dev.example.com 3000"
                );
                std::process::exit(1);
            };
            run_tunnel(&domain, port, cli.rewrite_host).await;
        }
    }
}

/// Tunnel `domain` to `127.0.0.1:<port>` until interrupted or disconnected.
async fn run_tunnel(domain: &str, port: u16, rewrite_host: bool) {
    let config = match Config::load() {
        Ok(Some(config)) => config,
        Ok(None) => {
            eprintln!(
                "culvert: no server configured; run `culvert config --server DOMAIN` first"
            );
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("culvert: {e:#}");
            std::process::exit(1);
        }
    };

    let client = match TunnelClient::connect(&config.ws_url(), domain, port, rewrite_host).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("culvert: failed to establish tunnel: {e}");
            std::process::exit(1);
        }
    };

    println!("Tunnel active: {} -> 127.0.0.1:{}", client.public_url(), port);
    println!("Press Ctrl+C to stop.");

    let endpoint = client.endpoint();
    tokio::select! {
        result = client.run() => {
            if let Err(e) = result {
                error!(error = %e, "tunnel ended");
                eprintln!("culvert: tunnel ended: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down tunnel");
            endpoint.close().await;
        }
    }

    println!("Tunnel closed");
}
