//! Contract-conformant example proxy - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use contract_example_proxy::{ProxyConfig, ProxyServer, ProxyService, ServerSettings};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "contract-example-proxy",
    about = "Proxy that selects contract examples for a mock engine and rejects undeclared requests",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "contract-proxy.yaml")]
    config: PathBuf,

    /// Contract document (overrides config)
    #[arg(long)]
    contract: Option<PathBuf>,

    /// Selection rule file (overrides config)
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Upstream mock engine base URL (overrides config)
    #[arg(long, value_name = "URL")]
    upstream: Option<String>,

    /// Per-request timeout in milliseconds (overrides config)
    #[arg(long, value_name = "N")]
    timeout_ms: Option<u64>,

    /// Diagnostics entries retained (overrides config)
    #[arg(long, value_name = "N")]
    diagnostics_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Load contract and rules, print a summary and exit
    #[arg(long)]
    validate: bool,
}

impl Args {
    fn apply_overrides(&self, config: &mut ProxyConfig) {
        if let Some(contract) = &self.contract {
            config.contract = contract.clone();
        }
        if let Some(rules) = &self.rules {
            config.rules = Some(rules.clone());
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(upstream) = &self.upstream {
            config.upstream = upstream.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.request_timeout_ms = timeout_ms;
        }
        if let Some(capacity) = self.diagnostics_capacity {
            config.diagnostics.capacity = capacity;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        print!("{}", serde_yaml::to_string(&ProxyConfig::default())?);
        return Ok(());
    }

    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        ProxyConfig::from_file(&args.config)?
    } else {
        info!("Using default configuration");
        ProxyConfig::default()
    };
    args.apply_overrides(&mut config);

    let proxy = match ProxyService::from_config(&config) {
        Ok(proxy) => Arc::new(proxy),
        Err(e) => {
            error!(error = %e, "Failed to start proxy");
            return Err(e);
        }
    };

    if args.validate {
        let contract = proxy.contract();
        println!(
            "Configuration is valid ({} operations, {} examples, contract {})",
            contract.len(),
            contract
                .operations()
                .iter()
                .map(|op| op.examples().len())
                .sum::<usize>(),
            contract.title().unwrap_or("untitled"),
        );
        return Ok(());
    }

    let settings = ServerSettings::from_config(&config);
    let server = ProxyServer::start(config.listen, proxy, &settings).await?;
    info!(
        address = %server.address,
        upstream = %config.upstream,
        admin_prefix = %settings.admin_prefix,
        "Contract example proxy started"
    );

    shutdown_signal().await;
    info!("Shutting down");
    server.close().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
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
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
