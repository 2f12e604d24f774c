use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use prom_feed_sync::config::{Settings, UpdateMode};
use prom_feed_sync::exit::{exit_code_for, EXIT_FAILURES};
use prom_feed_sync::feed;
use prom_feed_sync::prom::{Presence, ProductUpdate, PromClient};
use prom_feed_sync::sync::{self, SyncOptions};

#[derive(Parser, Debug)]
#[command(
    name = "prom-feed-sync",
    version,
    about = "Sync vendor XML feed prices and stock to Prom.ua"
)]
struct Args {
    /// TOML config file (environment variables override it)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Compute updates without sending anything
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch all feeds and push updates (default)
    Sync(SyncArgs),
    /// Send a single update by external code
    Push {
        /// Full external code, prefix included (e.g. SHOP_ABC-1)
        code: String,
        price: f64,
        /// Stock quantity; presence is derived from it
        #[arg(long)]
        quantity: Option<u64>,
    },
}

#[derive(clap::Args, Debug, Default)]
struct SyncArgs {
    /// Feed list file (overrides FEEDS_FILE)
    #[arg(long, value_name = "FILE")]
    feeds: Option<PathBuf>,

    /// Fields to update: both, prices or stocks (overrides UPDATE_MODE)
    #[arg(long, value_name = "MODE")]
    mode: Option<UpdateMode>,

    /// Push even if no feed changed since the last run
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is the normal case in CI
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Run aborted");
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut settings = Settings::load(args.config.as_deref()).context("Invalid configuration")?;
    if args.dry_run {
        settings.dry_run = true;
    }

    match args.command.unwrap_or(Command::Sync(SyncArgs::default())) {
        Command::Sync(sync_args) => run_sync(settings, sync_args).await,
        Command::Push {
            code,
            price,
            quantity,
        } => run_push(settings, code, price, quantity).await,
    }
}

async fn run_sync(mut settings: Settings, args: SyncArgs) -> Result<ExitCode> {
    if let Some(feeds) = args.feeds {
        settings.feeds_file = feeds;
    }
    if let Some(mode) = args.mode {
        settings.update_mode = mode;
    }
    settings.trace_loaded();

    let feeds = feed::read_feed_list(&settings.feeds_file).await?;

    let options = SyncOptions {
        force: args.force,
        ..Default::default()
    };
    let report = sync::run(&settings, &feeds, &options).await?;

    println!("{}", report);

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_FAILURES))
    }
}

async fn run_push(
    settings: Settings,
    code: String,
    price: f64,
    quantity: Option<u64>,
) -> Result<ExitCode> {
    if !price.is_finite() || price < 0.0 {
        anyhow::bail!("Price must be a non-negative number, got {}", price);
    }

    let update = ProductUpdate {
        id: code,
        price: Some(price),
        quantity_in_stock: quantity,
        presence: quantity.map(|q| Presence::from(q > 0)),
    };
    let payload = serde_json::to_string_pretty(&[&update])?;

    if settings.dry_run {
        println!("Dry run, would send to {}:\n{}", settings.update_url, payload);
        return Ok(ExitCode::SUCCESS);
    }

    let client = PromClient::new(&settings)?;
    tracing::info!(id = %update.id, url = %client.update_url(), "Sending single update");
    let outcome = client
        .update_products(std::slice::from_ref(&update))
        .await
        .context("Update request failed")?;

    if outcome.rejected.is_empty() {
        println!("Updated {}", update.id);
        Ok(ExitCode::SUCCESS)
    } else {
        for (id, reason) in &outcome.rejected {
            eprintln!("Rejected {}: {}", id, reason);
        }
        Ok(ExitCode::from(EXIT_FAILURES))
    }
}
