//! CI Tunnel Client
//!
//! Exposes a local server to the internet through a CI tunnel service.
//!
//! The client allocates a tunnel, opens a pool of transport channels to the
//! service and forwards every request (including WebSocket upgrades) to the
//! local server until the service reports the job as done or the process is
//! interrupted.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ci_tunnel::config::Config;
use ci_tunnel::{Tunnel, TunnelEvent, TunnelOptions};

#[derive(Parser, Debug)]
#[command(name = "ci-tunnel")]
#[command(author, version, about = "Expose a local server through a CI tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Tunnel service hostname
    #[arg(short, long, global = true, env = "CI_TUNNEL_SERVER")]
    server: Option<String>,

    /// API token for authentication
    #[arg(short = 'k', long, global = true, env = "CI_TUNNEL_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    start: StartArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Save the server and API token as defaults
    Login,
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Local port to expose
    #[arg(short, long)]
    port: Option<u16>,

    /// Local host to forward to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// The local server speaks HTTPS
    #[arg(long)]
    local_https: bool,

    /// Tunnel service port
    #[arg(long)]
    server_port: Option<u16>,

    /// Allocation API port (defaults to the service port)
    #[arg(long)]
    api_port: Option<u16>,

    /// Use plain http/ws toward the tunnel service
    #[arg(long)]
    insecure: bool,

    /// Request a specific subdomain
    #[arg(long)]
    subdomain: Option<String>,

    /// Log every forwarded request
    #[arg(long)]
    log_requests: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().unwrap_or_default();

    // Resolve server from CLI > config > default
    let server = cli
        .server
        .clone()
        .or(config.auth.server.clone())
        .unwrap_or_else(|| "localhost".to_string());

    match cli.command {
        Some(Commands::Login) => run_login(&server, cli.token),
        None => {
            init_logging(cli.verbose);
            let token = cli.token.or(config.auth.token.clone());
            run_start(&server, token, cli.start, &config).await
        }
    }
}

async fn run_start(
    server: &str,
    token: Option<String>,
    args: StartArgs,
    config: &Config,
) -> Result<()> {
    let port = args
        .port
        .context("A local port is required. Use --port <PORT>.")?;

    let mut options = TunnelOptions::new(port, server)
        .with_local_https(args.local_https)
        .with_log_requests(args.log_requests);
    if let Some(host) = args.host.or(config.tunnel.local_host.clone()) {
        options = options.with_local_host(host);
    }
    if let Some(server_port) = args.server_port.or(config.tunnel.server_port) {
        options = options.with_service_port(server_port);
    }
    if let Some(api_port) = args.api_port.or(config.tunnel.api_port) {
        options = options.with_api_port(api_port);
    }
    if args.insecure {
        options = options.with_service_tls(false);
    }
    if let Some(subdomain) = args.subdomain {
        options = options.with_subdomain(subdomain);
    }
    if let Some(token) = token {
        options = options.with_token(token);
    }

    let (tunnel, mut events) = Tunnel::new(options)?;
    let info = tunnel.open().await.context("Failed to open tunnel")?;

    println!("url: {}", info.url);
    println!("tunnel id: {}", info.tunnel_id);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TunnelEvent::Request { method, path }) => {
                    tracing::debug!("{} {}", method, path);
                }
                Some(TunnelEvent::TunnelDone { payload }) => {
                    info!("Tunnel done: {}", payload.unwrap_or_default());
                }
                Some(TunnelEvent::Error(e)) => warn!("Tunnel error: {}", e),
                Some(TunnelEvent::Close) | None => break,
                Some(TunnelEvent::Open { .. }) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                tunnel.close().await;
            }
        }
    }

    Ok(())
}

fn run_login(server: &str, token: Option<String>) -> Result<()> {
    let token = match token {
        Some(token) => token,
        None => {
            use std::io::{self, Write};

            print!("API Token: ");
            io::stdout().flush()?;

            let mut token = String::new();
            io::stdin().read_line(&mut token)?;
            token.trim().to_string()
        }
    };

    if token.is_empty() {
        anyhow::bail!("No token provided");
    }

    let mut config = Config::load().unwrap_or_default();
    config.auth.token = Some(token);
    config.auth.server = Some(server.to_string());
    config.save()?;

    println!(
        "Token saved to {:?}",
        Config::config_path().unwrap_or_default()
    );
    println!("You can now run: ci-tunnel --port <port>");

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
