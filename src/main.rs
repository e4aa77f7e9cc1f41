use std::path::PathBuf;

use clap::{Parser, Subcommand};

use recordproxy::{config::Config, logging, proxy, redact::Redactor};

#[derive(Debug, Parser)]
#[command(name = "recordproxy")]
struct Cli {
    /// Path to config TOML.
    #[arg(long, global = true, default_value = "recordproxy.toml")]
    config: PathBuf,
    /// Log level override (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Proxy every configured endpoint to its target, recording each
    /// request/response pair to disk.
    Record {
        /// Directory to store recorded requests and responses.
        #[arg(long, default_value = "recordings")]
        recording_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_path(&cli.config)?;
    logging::init(&config, cli.log_level.as_deref())?;

    match cli.command {
        Command::Record { recording_dir } => {
            let redactor = Redactor::from_env();
            proxy::run(&config, &recording_dir, redactor).await
        }
    }
}
