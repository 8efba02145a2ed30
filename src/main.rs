use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pacer::config::PacerConfig;
use pacer::ratelimit::{RateLimiter, DEFAULT_PLATFORM};
use pacer::store::RedisStore;

/// Per-user, per-platform admission control.
#[derive(Debug, Parser)]
#[command(name = "pacer", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "PACER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the counter store URL from the configuration
    #[arg(long)]
    redis_url: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask whether the user may act on the platform now
    Check { user_id: String, platform: String },
    /// Record one performed action
    Record { user_id: String, platform: String },
    /// Show usage for one platform
    Status { user_id: String, platform: String },
    /// Show usage for every registered platform
    StatusAll { user_id: String },
    /// Recommend a pause before the next action
    Delay { platform: String },
    /// Block until the user may act, or until the wait bound passes
    Wait {
        user_id: String,
        platform: String,
        #[arg(long)]
        max_wait_ms: Option<u64>,
    },
    /// Clear counters and cooldown for one platform
    Reset { user_id: String, platform: String },
    /// Clear counters and cooldowns for every platform
    ResetAll { user_id: String },
    /// Show the resolved limits for one platform, or all of them
    Limits { platform: Option<String> },
    /// Check that the counter store answers
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = PacerConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.redis_url {
        config.store.url = url;
    }
    info!(platforms = config.platforms.len(), "Configuration loaded");

    let store = Arc::new(RedisStore::new(&config.store)?);
    let limiter = RateLimiter::from_config(&config, store.clone());

    match cli.command {
        Command::Check { user_id, platform } => {
            let result = limiter.check_rate_limit(&user_id, &platform).await;
            print_json(&result)?;
            if !result.allowed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Record { user_id, platform } => {
            limiter.record_request(&user_id, &platform).await;
            let status = limiter.get_user_status(&user_id, &platform).await;
            print_json(&status)?;
        }
        Command::Status { user_id, platform } => {
            print_json(&limiter.get_user_status(&user_id, &platform).await)?;
        }
        Command::StatusAll { user_id } => {
            print_json(&limiter.get_all_platform_status(&user_id).await)?;
        }
        Command::Delay { platform } => {
            let delay_ms = limiter.get_optimal_delay(&platform);
            print_json(&json!({ "platform": platform, "delayMs": delay_ms }))?;
        }
        Command::Wait {
            user_id,
            platform,
            max_wait_ms,
        } => {
            let max_wait = max_wait_ms.map(Duration::from_millis);
            let available = tokio::select! {
                available = limiter.wait_for_availability(&user_id, &platform, max_wait) => available,
                _ = shutdown_signal() => false,
            };
            print_json(&json!({ "available": available }))?;
            if !available {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Reset { user_id, platform } => {
            let deleted = limiter.reset_user_limits(&user_id, &platform).await?;
            print_json(&json!({ "deleted": deleted }))?;
        }
        Command::ResetAll { user_id } => {
            let deleted = limiter.reset_all_user_limits(&user_id).await?;
            print_json(&json!({ "deleted": deleted }))?;
        }
        Command::Limits { platform: Some(platform) } => {
            print_json(&limiter.get_platform_limits(&platform))?;
        }
        Command::Limits { platform: None } => {
            let limits: BTreeMap<_, _> = limiter
                .limits()
                .platforms()
                .into_iter()
                .chain([DEFAULT_PLATFORM.to_string()])
                .map(|name| {
                    let limits = limiter.get_platform_limits(&name);
                    (name, limits)
                })
                .collect();
            print_json(&limits)?;
        }
        Command::Health => match store.ping().await {
            Ok(()) => print_json(&json!({ "healthy": true }))?,
            Err(e) => {
                print_json(&json!({ "healthy": false, "error": e.to_string() }))?;
                return Ok(ExitCode::FAILURE);
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}

/// Logs go to stderr so that stdout carries only command output.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, abandoning wait");
        }
        _ = terminate => {
            info!("Received SIGTERM, abandoning wait");
        }
    }
}
