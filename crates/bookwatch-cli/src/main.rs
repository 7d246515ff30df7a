use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bookwatch_core::{format_price, CatalogFormat};
use bookwatch_sync::{
    build_cron_scheduler, run_periodic, shutdown_on_ctrl_c, CatalogWorker, LogNotifier, Notifier,
    Reconciler, WatchConfig, WatchHandle,
};
use bookwatch_web::{AlertBoard, AppState};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bookwatch")]
#[command(about = "Watch bookseller prices for a list of ISBNs")]
struct Cli {
    /// Catalog file (CSV with ISBN, Price and optional Title columns).
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Seconds between reconciliation passes.
    #[arg(long, global = true)]
    interval_secs: Option<u64>,

    /// HTTP timeout per lookup, in seconds.
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[arg(long, global = true)]
    user_agent: Option<String>,

    /// Cron expression to use instead of the fixed interval.
    #[arg(long, global = true)]
    cron: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    fn config(&self) -> WatchConfig {
        let mut config = WatchConfig::from_env();
        if let Some(path) = &self.catalog {
            config.catalog_path = path.clone();
        }
        if let Some(secs) = self.interval_secs {
            config.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.timeout_secs {
            config.http_timeout_secs = secs;
        }
        if let Some(agent) = &self.user_agent {
            config.user_agent = agent.clone();
        }
        if let Some(expr) = &self.cron {
            config.cron = Some(expr.clone());
        }
        config
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check prices now and then on every interval until interrupted.
    Watch,
    /// Run a single reconciliation pass.
    Check,
    /// Print the tracked books.
    List,
    /// Look up a book and start tracking it.
    Add { isbn: String },
    /// Stop tracking a book.
    Remove { isbn: String },
    /// Run the dashboard alongside the periodic checks.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn catalog_worker(config: &WatchConfig, notifier: Arc<dyn Notifier>) -> Result<CatalogWorker> {
    let reconciler = Reconciler::new(config.price_source()?, notifier);
    Ok(CatalogWorker::new(config.catalog_store(), reconciler))
}

fn start_worker(config: &WatchConfig, notifier: Arc<dyn Notifier>) -> Result<WatchHandle> {
    let (handle, _task) = catalog_worker(config, notifier)?.spawn();
    Ok(handle)
}

/// Drive reconciliation passes until shutdown: on the cron schedule when one is
/// configured, otherwise every `config.interval`.
async fn run_schedule(
    handle: WatchHandle,
    config: WatchConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let Some(expr) = config.cron.as_deref() else {
        run_periodic(handle, config.interval, shutdown).await;
        return Ok(());
    };

    if let Err(err) = handle.refresh().await {
        warn!(error = %err, "initial reconciliation failed");
    }
    let mut sched = build_cron_scheduler(handle, expr).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %expr, "waiting for scheduled passes");
    let _ = shutdown.changed().await;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => {
            let handle = start_worker(&config, Arc::new(LogNotifier))?;
            run_schedule(handle, config, shutdown_on_ctrl_c()).await?;
        }
        Commands::Check => {
            let handle = start_worker(&config, Arc::new(LogNotifier))?;
            let report = handle.refresh().await?;
            for change in &report.changes {
                println!("{}\n", change.message());
            }
            for failure in &report.failures {
                eprintln!("error for ISBN {}: {}", failure.isbn, failure.message);
            }
            println!(
                "pass complete: checked={} changed={} failed={} saved={}",
                report.checked,
                report.changes.len(),
                report.failures.len(),
                report.saved
            );
        }
        Commands::List => {
            let handle = start_worker(&config, Arc::new(LogNotifier))?;
            let catalog = handle.snapshot().await?;
            for entry in catalog.iter() {
                println!(
                    "{:<15} £{:>9}  {}",
                    entry.isbn,
                    format_price(entry.last_price),
                    entry.title
                );
            }
        }
        Commands::Add { isbn } => {
            let handle = start_worker(&config, Arc::new(LogNotifier))?;
            let entry = handle.add(&isbn).await?;
            println!("Added: {}\nPrice: £{}", entry.title, format_price(entry.last_price));
        }
        Commands::Remove { isbn } => {
            let handle = start_worker(&config, Arc::new(LogNotifier))?;
            let entry = handle.remove(&isbn).await?;
            println!("Removed: {}", entry.display_title());
        }
        Commands::Serve { port } => {
            let alerts = Arc::new(AlertBoard::default());
            let (handle, _task) = catalog_worker(&config, alerts.clone())?
                .with_format(CatalogFormat::IsbnPriceTitle)
                .spawn();
            let shutdown = shutdown_on_ctrl_c();
            let port = port.unwrap_or(config.web_port);

            let schedule = tokio::spawn(run_schedule(
                handle.clone(),
                config,
                shutdown.clone(),
            ));
            let state = AppState::new(handle, alerts);
            bookwatch_web::serve(state, port, shutdown).await?;
            schedule.await.context("joining scheduler task")??;
        }
    }

    Ok(())
}
