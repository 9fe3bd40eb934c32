//! pulsed: the PulseGrid daemon.
//!
//! Single binary that assembles the PulseGrid subsystems:
//! - State store (redb): buckets, raw score log, guard records
//! - Engine: fanout writer, resolution cache, partial buckets, queries
//! - Dispatcher: debounced SSE fan-out with heartbeats
//! - Maintenance: window finalizer, partial refresh, retention purge
//! - Metrics reporter
//! - REST + SSE API
//!
//! # Usage
//!
//! ```text
//! pulsed run --config pulse.toml --port 8480 --data-dir /var/lib/pulsegrid
//! pulsed config > pulse.toml
//! ```

mod server;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pulse_core::PulseConfig;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,pulsed=debug,pulsegrid=debug";

#[derive(Parser)]
#[command(name = "pulsed", about = "PulseGrid sentiment time-series daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and API server.
    Run {
        /// Path to pulse.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the redb store (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Print a starter pulse.toml.
    Config,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = match config {
                Some(path) => PulseConfig::from_file(&path)?,
                None => PulseConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            config.validate()?;
            server::run(config).await
        }
        Command::Config => {
            print!("{}", PulseConfig::scaffold().to_toml_string()?);
            Ok(())
        }
    }
}
