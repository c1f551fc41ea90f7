//! Everline leader node
//!
//! Listens for follower broadcasts, keeps the latest report per follower and
//! prints the status table until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use everline_core::clock::MonotonicClock;
use everline_core::registry::LeaderRegistry;
use everline_core::scheduler::{attach_receiver, run_leader, LeaderScheduler};
use everline_core::summary::{ConsoleSummary, SummarySink, TracingSummary};
use everline_core::telemetry::init_logging;
use everline_core::transport::UdpTransportBuilder;
use everline_core::NodeConfig;

/// Everline monitoring leader
#[derive(Parser, Debug)]
#[command(name = "everline-leader")]
#[command(about = "Collect follower event counts and print a periodic summary", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP address to listen on
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Forget a follower after this much silence
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    summary_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs and summaries as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(bind) = self.bind {
            config.network.bind_addr = bind;
        }
        if let Some(timeout) = self.timeout_ms {
            config.leader.follower_timeout_ms = timeout;
        }
        if let Some(interval) = self.summary_interval_ms {
            config.leader.summary_interval_ms = interval;
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

    let registry = Arc::new(LeaderRegistry::new(
        config.leader.follower_timeout_ms,
        config.leader.max_followers,
    ));
    let clock = MonotonicClock::new();

    let mut transport = UdpTransportBuilder::new(config.network.bind_addr)
        .bind()
        .await
        .context("starting leader transport")?;
    attach_receiver(&mut transport, Arc::clone(&registry), clock.clone())?;
    tracing::info!(local_addr = %transport.local_addr()?, "listening for followers");

    let mut sink: Box<dyn SummarySink> = if config.logging.json {
        Box::new(TracingSummary)
    } else {
        Box::new(ConsoleSummary::stdout())
    };

    let scheduler = LeaderScheduler::new(
        config.leader.eviction_interval_ms,
        config.leader.summary_interval_ms,
    );
    run_leader(
        registry,
        &clock,
        sink.as_mut(),
        scheduler,
        Duration::from_millis(everline_core::LOOP_DELAY_MS),
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for Ctrl-C");
            }
        },
    )
    .await;

    drop(transport);
    Ok(())
}
