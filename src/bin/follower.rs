//! Everline follower node
//!
//! Counts level changes on one digital input and broadcasts the running
//! total until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use everline_core::clock::MonotonicClock;
use everline_core::contracts::LinkAddress;
use everline_core::follower::FollowerAgent;
use everline_core::input::{InputSource, SharedLevel, SysfsGpioInput};
use everline_core::scheduler::run_follower;
use everline_core::telemetry::init_logging;
use everline_core::transport::UdpTransportBuilder;
use everline_core::NodeConfig;

/// Everline sensor follower
#[derive(Parser, Debug)]
#[command(name = "everline-follower")]
#[command(about = "Broadcast an input transition count to the leader", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name reported to the leader (at most 16 bytes)
    #[arg(long)]
    identity: Option<String>,

    /// GPIO value file to sample
    #[arg(long)]
    input: Option<PathBuf>,

    /// Destination for broadcasts
    #[arg(long)]
    broadcast: Option<SocketAddr>,

    #[arg(long)]
    send_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    json: bool,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(identity) = &self.identity {
            config.follower.identity = identity.clone();
        }
        if let Some(input) = &self.input {
            config.follower.input_path = Some(input.clone());
        }
        if let Some(broadcast) = self.broadcast {
            config.network.broadcast_addr = broadcast;
        }
        if let Some(interval) = self.send_interval_ms {
            config.follower.send_interval_ms = interval;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = NodeConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);

    init_logging(&config.logging)?;
    config.validate()?;

    let identity = config.follower.identity()?;
    let link_address = match config.follower.link_address()? {
        Some(address) => address,
        None => LinkAddress::random_local(&mut rand::thread_rng()),
    };

    let mut input: Box<dyn InputSource> = match &config.follower.input_path {
        Some(path) => Box::new(SysfsGpioInput::new(path)),
        None => {
            tracing::warn!("no input configured, level stays low");
            Box::new(SharedLevel::new(false))
        }
    };
    let initial_level = input.read_level().context("reading initial input level")?;

    // the follower never receives, so any local port will do
    let local = SocketAddr::new(config.network.bind_addr.ip(), 0);
    let transport = UdpTransportBuilder::new(local)
        .with_broadcast(true)
        .bind()
        .await
        .context("starting follower transport")?;

    let mut agent = FollowerAgent::new(
        identity,
        link_address,
        initial_level,
        config.follower.send_interval_ms,
        transport,
        config.network.broadcast_addr,
    );

    let clock = MonotonicClock::new();
    run_follower(
        &mut agent,
        input.as_mut(),
        &clock,
        Duration::from_millis(config.follower.poll_interval_ms),
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for Ctrl-C");
            }
        },
    )
    .await;

    Ok(())
}
