use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::RateLimiter;

/// Operator tool for the Tollgate rate limiter.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count requests for an identifier under a policy and print each decision
    Check {
        /// Policy name, e.g. login
        #[arg(long)]
        policy: String,

        /// Identifier being limited, e.g. an email or IP address
        #[arg(long)]
        identifier: String,

        /// Number of checks to run
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        times: u32,
    },
    /// Ping the distributed counter store
    Health,
    /// Print the resolved policy catalog
    Policies,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = TollgateConfig::load(cli.config.as_deref())?;
    let limiter = RateLimiter::from_config(&config).await?;
    info!(distributed = limiter.is_distributed(), "Rate limiter initialized");

    let outcome = run(&limiter, cli.command).await;
    limiter.shutdown().await;
    Ok(ExitCode::from(outcome?))
}

/// Run one command and return the process exit status.
async fn run(limiter: &RateLimiter, command: Command) -> anyhow::Result<u8> {
    match command {
        Command::Check {
            policy,
            identifier,
            times,
        } => {
            let mut admitted = true;
            for _ in 0..times {
                let result = limiter.check_policy(&identifier, &policy).await?;
                println!("{}", serde_json::to_string(&result)?);
                admitted = result.success;
            }
            Ok(if admitted { 0 } else { 2 })
        }
        Command::Health => match limiter.health_check().await {
            None => {
                println!("memory-only");
                Ok(0)
            }
            Some(true) => {
                println!("healthy");
                Ok(0)
            }
            Some(false) => {
                println!("unreachable");
                Ok(1)
            }
        },
        Command::Policies => {
            print!("{}", serde_yaml::to_string(limiter.policies())?);
            Ok(0)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
