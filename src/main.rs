use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use battlepush::notify::TelegramNotifier;
use battlepush::scheduler::PushScheduler;
use battlepush::stats_api::StatsClient;
use battlepush::store::FileStore;
use battlepush::sweeper::KeepAliveSweeper;

#[derive(Parser, Debug)]
#[command(
    name = "battlepush",
    version,
    about = "Battle-push scheduler",
    long_about = "Polls a game-stats API per subscribed user and pushes new battle results to chat"
)]
struct Cli {
    /// Directory holding the per-user poll records
    #[arg(short, long = "data-dir", env = "BATTLEPUSH_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Telegram bot token used for push delivery
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", global = true)]
    bot_token: Option<String>,

    /// Base URL of the game-stats API
    #[arg(long, env = "BATTLEPUSH_API_BASE", global = true)]
    api_base: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the push scheduler and keep-alive sweeper until interrupted
    Run {
        /// Seconds between polling ticks per user
        #[arg(long, default_value = "10")]
        poll_interval: u64,

        /// Seconds between keep-alive sweeps over stored sessions
        #[arg(long, default_value = "21600")]
        sweep_interval: u64,
    },

    /// List the persisted polls and their running statistics
    ListPolls,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let args = Cli::parse();
    if args.verbose {
        debug!("Verbose mode enabled");
    }

    let data_dir = args.data_dir.context(
        "Data directory not specified. Please set --data-dir or BATTLEPUSH_DATA_DIR environment variable",
    )?;
    let store = Arc::new(FileStore::new(&data_dir)?);

    match args.command {
        Commands::Run {
            poll_interval,
            sweep_interval,
        } => {
            let bot_token = args.bot_token.context(
                "Bot token not specified. Please set --bot-token or TELEGRAM_BOT_TOKEN environment variable",
            )?;
            let api_base = args
                .api_base
                .unwrap_or_else(|| StatsClient::default_base_url().to_string());

            let fetcher = Arc::new(StatsClient::new(api_base)?);
            let notifier = Arc::new(TelegramNotifier::new(&bot_token)?);

            let scheduler = PushScheduler::new(
                fetcher.clone(),
                notifier,
                store.clone(),
                Duration::from_secs(poll_interval),
            );
            // Restore persisted jobs before anything else may start new ones.
            let restored = scheduler.load_and_start_all().await?;
            info!("battlepush running with {restored} restored push jobs");

            let sweeper =
                KeepAliveSweeper::new(fetcher, store, Duration::from_secs(sweep_interval));
            let sweep_task = sweeper.spawn();

            signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
            info!("received shutdown signal, stopping push jobs");

            sweep_task.abort();
            scheduler.shutdown().await;
            info!("shutdown complete");
        }

        Commands::ListPolls => {
            let records = store.list_records()?;
            if records.is_empty() {
                println!("No polls stored in {path}", path = data_dir.display());
                return Ok(());
            }
            for record in records {
                let poll = &record.poll;
                println!(
                    "user {owner}: push={push} chat={chat} games={games} wins={wins} ({rate:.1}%) streak={streak} last_battle={last:?} session={session}",
                    owner = poll.owner_id,
                    push = record.push,
                    chat = poll.destination.chat_id,
                    games = poll.game_count,
                    wins = poll.win_count,
                    rate = poll.win_rate(),
                    streak = poll.streak,
                    last = poll.last_seen_battle_id,
                    session = if poll.session_credential.is_some() { "stored" } else { "none" },
                );
            }
        }
    }

    Ok(())
}
