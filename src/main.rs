//! mammothd - standalone MQTT 3.1.1 broker.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mammoth::{Broker, BrokerConfig};
use tracing_subscriber::EnvFilter;

/// MQTT 3.1.1 broker with QoS 0/1/2, retained messages and persistent
/// sessions.
#[derive(Parser, Debug)]
#[command(name = "mammothd")]
#[command(about = "MQTT 3.1.1 broker")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:1883")]
    listen: String,

    /// Base retransmission interval in seconds for unacknowledged
    /// QoS 1/2 packets (doubles per retry)
    #[arg(long, default_value_t = 5)]
    retry_interval: u64,

    /// Retries before an in-flight delivery is abandoned
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = BrokerConfig::new(args.listen)
        .retry_interval(Duration::from_secs(args.retry_interval))
        .max_retries(args.max_retries);

    let broker = Broker::new(config);
    broker.serve().await?;
    Ok(())
}
