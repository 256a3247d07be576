//! # ChatClaw — stream dispatch simulator
//!
//! Runs the stream dispatcher against a simulated message load and a
//! simulated activator, then prints dispatcher statistics.
//!
//! Usage:
//!   chatclaw                              # 4 streams, 30 seconds
//!   chatclaw --streams 16 --rate-ms 100   # Busier load
//!   chatclaw --config ./chatclaw.toml     # Custom config
//!   chatclaw --init-config                # Write default config and exit

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chatclaw_core::{ActivationOutcome, Activator, ChatClawConfig, ChatClawError};
use chatclaw_scheduler::StreamDispatcher;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "chatclaw",
    version,
    about = "🦀 ChatClaw — per-stream response scheduling simulator"
)]
struct Cli {
    /// Config file (default: ~/.chatclaw/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Number of simulated conversation streams
    #[arg(long, default_value = "4")]
    streams: usize,

    /// Mean gap between simulated messages, in milliseconds
    #[arg(long, default_value = "400")]
    rate_ms: u64,

    /// How long to run, in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Upper bound on simulated reply latency, in milliseconds
    #[arg(long, default_value = "1500")]
    reply_ms: u64,

    /// Probability that a simulated activation fails
    #[arg(long, default_value = "0.05")]
    failure_rate: f64,

    /// RNG seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Write the default config to --config (or the default path) and exit
    #[arg(long)]
    init_config: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Stands in for the chat agent: thinks for a while, then replies or fails.
struct SimulatedActivator {
    max_latency: Duration,
    failure_rate: f64,
    rng: Mutex<StdRng>,
}

#[async_trait]
impl Activator for SimulatedActivator {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn activate(
        &self,
        stream_id: &str,
        cancel: CancellationToken,
    ) -> chatclaw_core::Result<ActivationOutcome> {
        let (latency, fail, actions) = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            let max_ms = self.max_latency.as_millis().max(1) as u64;
            (
                Duration::from_millis(rng.gen_range(0..=max_ms)),
                rng.gen_bool(self.failure_rate),
                rng.gen_range(0..=2u32),
            )
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(ChatClawError::Cancelled),
            _ = tokio::time::sleep(latency) => {}
        }

        if fail {
            return Err(ChatClawError::Activation(format!("simulated failure on {stream_id}")));
        }
        if actions == 0 {
            return Ok(ActivationOutcome::Skipped);
        }
        tracing::debug!("💬 [{}] replied with {} action(s) after {:?}", stream_id, actions, latency);
        Ok(ActivationOutcome::replied(actions))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "chatclaw=debug,chatclaw_scheduler=debug"
    } else {
        "chatclaw=info,chatclaw_scheduler=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
    }

    let config_path = cli
        .config
        .as_deref()
        .map(|p| std::path::PathBuf::from(expand_path(p)));

    if cli.init_config {
        let path = config_path.unwrap_or_else(ChatClawConfig::default_path);
        ChatClawConfig::default().save_to(&path)?;
        println!("✅ Default config written to {}", path.display());
        return Ok(());
    }

    let config = match &config_path {
        Some(path) => ChatClawConfig::load_from(path)?,
        None => ChatClawConfig::load()?,
    };
    config.validate()?;

    if cli.streams == 0 {
        anyhow::bail!("--streams must be at least 1");
    }
    if !(0.0..=1.0).contains(&cli.failure_rate) {
        anyhow::bail!("--failure-rate must be within [0, 1]");
    }

    let activator = Arc::new(SimulatedActivator {
        max_latency: Duration::from_millis(cli.reply_ms),
        failure_rate: cli.failure_rate,
        rng: Mutex::new(rng_from(cli.seed)),
    });
    let dispatcher = StreamDispatcher::from_config(&config, activator)?;
    dispatcher.start()?;

    println!("🦀 ChatClaw v{}", env!("CARGO_PKG_VERSION"));
    println!("   Streams:  {}", cli.streams);
    println!("   Rate:     ~1 message / {}ms", cli.rate_ms);
    println!("   Duration: {}s", cli.duration);
    println!("   Base interval: {}s", config.dispatch.distribution_interval);
    println!();

    let streams: Vec<String> = (0..cli.streams).map(|i| format!("stream-{i}")).collect();
    let mut rng = rng_from(cli.seed.map(|s| s.wrapping_add(1)));
    let deadline = tokio::time::sleep(Duration::from_secs(cli.duration));
    tokio::pin!(deadline);

    loop {
        let gap = Duration::from_millis(rng.gen_range(0..=cli.rate_ms.saturating_mul(2)));
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                println!("\n⏹️  Interrupted");
                break;
            }
            _ = tokio::time::sleep(gap) => {}
        }

        // Skew traffic so a few streams are much busier than the rest.
        let idx = rng.gen_range(0..streams.len()).min(rng.gen_range(0..streams.len()));
        let state = dispatcher.on_message_received(&streams[idx]).await;
        tracing::debug!("📨 [{}] message received, now {}", streams[idx], state);
    }

    dispatcher.stop().await;

    let stats = dispatcher.stats().await;
    println!("📊 Dispatcher stats:");
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let failures: Vec<_> = dispatcher
        .history()
        .history()
        .into_iter()
        .filter(|r| r.outcome.is_failure())
        .collect();
    if !failures.is_empty() {
        println!("\n⚠️  {} failed dispatch(es) in recent history:", failures.len());
        for record in failures {
            println!(
                "   [{}] gen {}: {}",
                record.stream_id,
                record.generation,
                serde_json::to_string(&record.outcome)?
            );
        }
    }
    Ok(())
}
