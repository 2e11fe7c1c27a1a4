//! Mailforge - standalone campaign worker entry point
//!
//! Runs one worker pass for a single user: resumes the user's persisted
//! campaign and drives it until completion, a quota stop, an external
//! pause/cancel, or failure. Exits 0 when the pass finished or another
//! worker was already active for the user; a missing user argument exits 2.

use anyhow::Result;
use clap::Parser;
use mailforge_common::config::Config;
use mailforge_common::types::OwnerId;
use mailforge_engine::{CampaignEngine, LogNotifier, SmtpSender, WorkerExit};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "mailforge-worker", about = "Run one campaign worker pass for a user")]
struct Cli {
    /// User identifier whose campaign to drive
    user: OwnerId,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    let transport = Arc::new(SmtpSender::new(Duration::from_secs(
        config.smtp.send_timeout_secs,
    )));
    let engine = CampaignEngine::new(config, Arc::new(LogNotifier), transport)?;

    match engine.run_worker(cli.user).await? {
        WorkerExit::AlreadyRunning => {
            info!(user = cli.user, "Worker already active; nothing to do");
        }
        exit => {
            info!(user = cli.user, outcome = ?exit, "Worker pass finished");
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mailforge=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
