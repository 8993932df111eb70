//! Session store operator CLI.
//!
//! # Commands
//!
//! - `sessionstore gc` - Delete expired sessions from the table
//! - `sessionstore config` - Print the resolved configuration

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use sessionstore_dynamodb::ConfigLayer;

mod commands;
mod error;

use commands::{config, gc};
use error::CliResult;

/// Session store maintenance tools
#[derive(Parser)]
#[command(name = "sessionstore")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(about = "Maintenance tools for the DynamoDB session store")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete sessions older than --max-age or idle longer than --max-stale
    Gc(GcArgs),

    /// Print the resolved configuration (secret redacted)
    #[command(alias = "c")]
    Config(SourceArgs),
}

/// Where options come from; anything unset falls back to the
/// configuration file, then the environment.
#[derive(Args, Clone, Default)]
struct SourceArgs {
    /// Configuration file (TOML or JSON)
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Session table name
    #[arg(long, value_name = "NAME")]
    table: Option<String>,
}

impl SourceArgs {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            config_file: self.config.clone(),
            table_name: self.table.clone(),
            ..Default::default()
        }
    }
}

#[derive(Args)]
struct GcArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Delete sessions created more than SECS seconds ago
    #[arg(long, value_name = "SECS")]
    max_age: Option<f64>,

    /// Delete sessions not updated for more than SECS seconds
    #[arg(long, value_name = "SECS")]
    max_stale: Option<f64>,

    /// Items evaluated per scan page
    #[arg(long, value_name = "N")]
    scan_limit: Option<u32>,

    /// DynamoDB endpoint, e.g. http://localhost:8000 for DynamoDB Local
    #[arg(long, value_name = "URL", env = "AWS_ENDPOINT_URL_DYNAMODB")]
    endpoint_url: Option<String>,

    /// AWS region
    #[arg(long, value_name = "REGION")]
    region: Option<String>,
}

impl GcArgs {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            max_age: self.max_age,
            max_stale: self.max_stale,
            gc_scan_limit: self.scan_limit,
            ..self.source.layer()
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    let result: CliResult<()> = match cli.command {
        Commands::Gc(args) => {
            gc::run(args.layer(), args.region.clone(), args.endpoint_url.clone()).await
        }
        Commands::Config(args) => config::run(args.layer()),
    };

    if let Err(e) = result {
        eprintln!("\n  {} {}\n", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
