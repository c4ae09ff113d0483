//! sdetcd
//!
//! Resolves backends registered in etcd from a gateway configuration file
//! and logs every change to them until interrupted.

mod gateway;
mod observability;

use anyhow::anyhow;
use clap::Parser;
use observability::LogFormat;
use sdetcd_core::{new_client, Subscriber, SubscriberFactory};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "sdetcd")]
#[command(about = "Watch etcd-registered backends the way a gateway would")]
struct Cli {
    /// Gateway configuration file (JSON) carrying the discovery block
    #[arg(long, env = "SDETCD_CONFIG")]
    config: PathBuf,

    /// Key prefix to follow; repeat or comma-separate for several
    #[arg(long = "prefix", env = "SDETCD_PREFIXES", value_delimiter = ',', required = true)]
    prefixes: Vec<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "SDETCD_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    observability::init_tracing(cli.log_format)?;
    if let Some(addr) = cli.metrics_addr {
        observability::init_metrics(addr)?;
    }

    info!(config = %cli.config.display(), "Starting sdetcd");

    let extra = gateway::load_extra_config(&cli.config)?;
    let cancel = CancellationToken::new();
    let client = new_client(cancel.clone(), &extra).await?;
    let factory = SubscriberFactory::new(client, cancel.clone());

    let mut reporters = Vec::with_capacity(cli.prefixes.len());
    for prefix in &cli.prefixes {
        let subscriber = factory.subscriber(prefix).await?;
        info!(prefix = %prefix, hosts = ?subscriber.hosts(), "Backends resolved");
        reporters.push(tokio::spawn(report(subscriber, cancel.clone())));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();

    for reporter in reporters {
        reporter.await?;
    }
    Ok(())
}

async fn report(subscriber: Subscriber, cancel: CancellationToken) {
    let mut changes = subscriber.changes();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let hosts = changes.borrow_and_update().clone();
                info!(prefix = %subscriber.prefix(), hosts = ?hosts, "Backends changed");
            }
        }
    }
}
