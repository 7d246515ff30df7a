//! Price reconciliation, the catalog worker and the polling scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bookwatch_adapters::{
    AbeBooksSource, Listing, LookupError, LookupErrorKind, PriceSource, DEFAULT_BASE_URL,
};
use bookwatch_core::{
    format_price, normalize_isbn, Catalog, CatalogEntry, CatalogFormat, DuplicateIsbn,
    InvalidIsbn, PriceChange, UNKNOWN_TITLE,
};
use bookwatch_storage::{
    CatalogError, CatalogStore, HttpClientConfig, HttpFetcher, DEFAULT_USER_AGENT,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bookwatch-sync";

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub catalog_path: PathBuf,
    pub interval: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub base_url: String,
    pub cron: Option<String>,
    pub web_port: u16,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("books.txt"),
            interval: Duration::from_secs(3600),
            http_timeout_secs: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            cron: None,
            web_port: 8000,
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            catalog_path: std::env::var("BOOKWATCH_CATALOG")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_path),
            interval: std::env::var("BOOKWATCH_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            http_timeout_secs: std::env::var("BOOKWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("BOOKWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            base_url: std::env::var("BOOKWATCH_BASE_URL").unwrap_or(defaults.base_url),
            cron: std::env::var("BOOKWATCH_CRON")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            web_port: std::env::var("BOOKWATCH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn price_source(&self) -> Result<Arc<dyn PriceSource>> {
        let http = HttpFetcher::new(self.http_config())?;
        Ok(Arc::new(AbeBooksSource::new(http, self.base_url.clone())))
    }

    pub fn catalog_store(&self) -> CatalogStore {
        CatalogStore::new(self.catalog_path.clone())
    }
}

/// Surfaces a price change to the user. Called from the worker task; must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, change: &PriceChange);
}

/// Headless alert surface: writes the alert to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, change: &PriceChange) {
        info!(
            isbn = %change.isbn,
            url = %change.listing_url,
            "price alert: {}",
            change.message().replace('\n', " | ")
        );
    }
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub entry: CatalogEntry,
    pub change: Option<PriceChange>,
    pub title_updated: bool,
}

#[derive(Debug, Clone)]
pub struct PassFailure {
    pub isbn: String,
    pub kind: LookupErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub changes: Vec<PriceChange>,
    pub failures: Vec<PassFailure>,
    /// Some entry's price, or a title the file stores, was modified.
    pub dirty: bool,
    pub saved: bool,
}

pub struct Reconciler {
    source: Arc<dyn PriceSource>,
    notifier: Arc<dyn Notifier>,
}

impl Reconciler {
    pub fn new(source: Arc<dyn PriceSource>, notifier: Arc<dyn Notifier>) -> Self {
        Self { source, notifier }
    }

    pub fn source(&self) -> Arc<dyn PriceSource> {
        Arc::clone(&self.source)
    }

    /// Fetch the current listing for one entry and compute its updated state.
    ///
    /// Prices are compared with exact decimal equality; any difference counts.
    pub async fn reconcile_one(&self, entry: &CatalogEntry) -> Result<Reconciled, LookupError> {
        let listing = self.source.fetch(&entry.isbn).await?;
        Ok(apply_listing(entry, listing))
    }

    /// Reconcile every entry in file order. Lookup failures are logged and skipped.
    pub async fn reconcile_all(&self, catalog: &mut Catalog) -> PassReport {
        let started_at = Utc::now();
        let mut changes = Vec::new();
        let mut failures = Vec::new();
        let mut dirty = false;
        // Titles only reach the file in the three-column layout.
        let titles_stored = catalog.format == CatalogFormat::IsbnPriceTitle;

        for entry in catalog.entries_mut() {
            match self.reconcile_one(entry).await {
                Ok(reconciled) => {
                    if let Some(change) = &reconciled.change {
                        info!(
                            isbn = %change.isbn,
                            old = %format_price(change.old_price),
                            new = %format_price(change.new_price),
                            "price changed for '{}'",
                            change.title
                        );
                        self.notifier.notify(change);
                        changes.push(change.clone());
                    } else {
                        info!(
                            isbn = %entry.isbn,
                            price = %format_price(entry.last_price),
                            "no change for '{}'",
                            reconciled.entry.display_title()
                        );
                    }
                    dirty |= reconciled.change.is_some()
                        || (titles_stored && reconciled.title_updated);
                    *entry = reconciled.entry;
                }
                Err(err) => {
                    warn!(isbn = %entry.isbn, error = %err, "price lookup failed");
                    failures.push(PassFailure {
                        isbn: entry.isbn.clone(),
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                }
            }
        }

        PassReport {
            started_at,
            finished_at: Utc::now(),
            checked: catalog.len(),
            changes,
            failures,
            dirty,
            saved: false,
        }
    }
}

fn apply_listing(entry: &CatalogEntry, listing: Listing) -> Reconciled {
    let mut updated = entry.clone();

    // Keep a resolved title rather than replacing it with the placeholder.
    let title_known = listing.title != UNKNOWN_TITLE || entry.title.is_empty();
    let title_updated = title_known && updated.title != listing.title;
    if title_updated {
        updated.title = listing.title;
    }

    let change = if listing.price != entry.last_price {
        updated.last_price = listing.price;
        Some(PriceChange {
            isbn: entry.isbn.clone(),
            title: updated.display_title().to_string(),
            old_price: entry.last_price,
            new_price: listing.price,
            listing_url: listing.listing_url,
        })
    } else {
        None
    };

    Reconciled {
        entry: updated,
        change,
        title_updated,
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    DuplicateIsbn(#[from] DuplicateIsbn),
    #[error(transparent)]
    InvalidIsbn(#[from] InvalidIsbn),
    #[error("ISBN {0} is not in the catalog")]
    UnknownIsbn(String),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("catalog worker has stopped")]
    WorkerGone,
}

type Reply<T> = oneshot::Sender<Result<T, WatchError>>;

enum Command {
    Refresh { reply: Option<Reply<PassReport>> },
    Add { isbn: String, reply: Reply<CatalogEntry> },
    Remove { isbn: String, reply: Reply<CatalogEntry> },
    Snapshot { reply: Reply<Catalog> },
}

/// Owns the catalog. Every read-modify-write of the catalog file runs here, one
/// command at a time, so a reconciliation pass cannot overwrite an interactive edit.
///
/// After each command the worker publishes its catalog, so readers never queue
/// behind a pass that is still fetching.
pub struct CatalogWorker {
    store: CatalogStore,
    reconciler: Reconciler,
    catalog: Catalog,
    /// Column layout to write regardless of what the file was read with.
    format: Option<CatalogFormat>,
    loaded: bool,
    /// In-memory state not yet persisted because a save failed.
    dirty: bool,
    published: watch::Sender<Option<Catalog>>,
}

impl CatalogWorker {
    pub fn new(store: CatalogStore, reconciler: Reconciler) -> Self {
        let (published, _) = watch::channel(None);
        Self {
            store,
            reconciler,
            catalog: Catalog::default(),
            format: None,
            loaded: false,
            dirty: false,
            published,
        }
    }

    /// Always store the catalog in `format`, upgrading the file on its next save.
    pub fn with_format(mut self, format: CatalogFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn spawn(self) -> (WatchHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = WatchHandle {
            tx,
            source: self.reconciler.source(),
            published: self.published.subscribe(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        if let Err(err) = self.sync_from_disk().await {
            warn!(error = %err, "initial catalog load failed");
        }
        self.publish();

        while let Some(command) = rx.recv().await {
            match command {
                Command::Refresh { reply } => {
                    let result = self.refresh().await;
                    self.publish();
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Command::Add { isbn, reply } => {
                    let result = self.add(&isbn).await;
                    self.publish();
                    let _ = reply.send(result);
                }
                Command::Remove { isbn, reply } => {
                    let result = self.remove(&isbn).await;
                    self.publish();
                    let _ = reply.send(result);
                }
                Command::Snapshot { reply } => {
                    let result = self.sync_from_disk().await.map(|()| self.catalog.clone());
                    self.publish();
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn publish(&self) {
        if self.loaded {
            self.published.send_replace(Some(self.catalog.clone()));
        }
    }

    /// Pick up hand edits made between operations, unless unsaved state would be lost.
    async fn sync_from_disk(&mut self) -> Result<(), WatchError> {
        if self.loaded && self.dirty {
            return Ok(());
        }
        self.catalog = self.store.load().await?;
        if let Some(format) = self.format {
            self.catalog.format = format;
        }
        self.loaded = true;
        Ok(())
    }

    async fn persist(&mut self) -> Result<(), WatchError> {
        match self.store.save(&self.catalog).await {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(err) => {
                self.dirty = true;
                Err(err.into())
            }
        }
    }

    async fn refresh(&mut self) -> Result<PassReport, WatchError> {
        if let Err(err) = self.sync_from_disk().await {
            warn!(error = %err, "skipping reconciliation pass: catalog unavailable");
            return Err(err);
        }

        let mut report = self.reconciler.reconcile_all(&mut self.catalog).await;
        if report.dirty || self.dirty {
            match self.persist().await {
                Ok(()) => report.saved = true,
                Err(err) => warn!(
                    error = %err,
                    "saving catalog failed; keeping updates in memory for the next save"
                ),
            }
        }
        info!(
            checked = report.checked,
            changed = report.changes.len(),
            failed = report.failures.len(),
            saved = report.saved,
            "reconciliation pass complete"
        );
        Ok(report)
    }

    async fn add(&mut self, raw_isbn: &str) -> Result<CatalogEntry, WatchError> {
        let isbn = normalize_isbn(raw_isbn)?;
        self.sync_from_disk().await?;
        if self.catalog.contains(&isbn) {
            return Err(DuplicateIsbn(isbn).into());
        }

        let listing = self.reconciler.source.fetch(&isbn).await?;
        let entry = CatalogEntry::new(isbn.clone(), listing.price).with_title(listing.title);
        let (was_dirty, previous_format) = (self.dirty, self.catalog.format);
        if entry.title != UNKNOWN_TITLE {
            self.catalog.format = CatalogFormat::IsbnPriceTitle;
        }
        self.catalog.insert(entry.clone())?;

        if let Err(err) = self.persist().await {
            self.catalog.remove(&isbn);
            self.catalog.format = previous_format;
            self.dirty = was_dirty;
            return Err(err);
        }
        info!(isbn = %entry.isbn, price = %format_price(entry.last_price), "added '{}'", entry.title);
        Ok(entry)
    }

    async fn remove(&mut self, raw_isbn: &str) -> Result<CatalogEntry, WatchError> {
        let isbn = raw_isbn.trim();
        self.sync_from_disk().await?;
        let Some((index, entry)) = self.catalog.remove(isbn) else {
            return Err(WatchError::UnknownIsbn(isbn.to_string()));
        };

        let was_dirty = self.dirty;
        if let Err(err) = self.persist().await {
            self.catalog.restore(index, entry);
            self.dirty = was_dirty;
            return Err(err);
        }
        info!(isbn = %entry.isbn, "removed '{}'", entry.display_title());
        Ok(entry)
    }
}

/// Cloneable front door to a running [`CatalogWorker`].
#[derive(Clone)]
pub struct WatchHandle {
    tx: mpsc::Sender<Command>,
    source: Arc<dyn PriceSource>,
    published: watch::Receiver<Option<Catalog>>,
}

impl WatchHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, WatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| WatchError::WorkerGone)?;
        rx.await.map_err(|_| WatchError::WorkerGone)?
    }

    /// Run a reconciliation pass and wait for its report.
    pub async fn refresh(&self) -> Result<PassReport, WatchError> {
        self.call(|reply| Command::Refresh { reply: Some(reply) }).await
    }

    /// Queue a reconciliation pass without waiting for it.
    pub async fn request_refresh(&self) -> Result<(), WatchError> {
        self.tx
            .send(Command::Refresh { reply: None })
            .await
            .map_err(|_| WatchError::WorkerGone)
    }

    pub async fn add(&self, isbn: &str) -> Result<CatalogEntry, WatchError> {
        let isbn = isbn.to_string();
        self.call(|reply| Command::Add { isbn, reply }).await
    }

    pub async fn remove(&self, isbn: &str) -> Result<CatalogEntry, WatchError> {
        let isbn = isbn.to_string();
        self.call(|reply| Command::Remove { isbn, reply }).await
    }

    /// Reload the catalog from disk through the worker, after any queued commands.
    pub async fn snapshot(&self) -> Result<Catalog, WatchError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    /// The catalog as of the worker's last finished command. Does not wait for a
    /// running pass; only falls back to [`WatchHandle::snapshot`] before the first load.
    pub async fn latest(&self) -> Result<Catalog, WatchError> {
        let published = self.published.borrow().clone();
        match published {
            Some(catalog) => Ok(catalog),
            None => self.snapshot().await,
        }
    }

    pub fn listing_url(&self, isbn: &str) -> String {
        self.source.listing_url(isbn)
    }
}

/// Run a pass now, then every `interval`, until `shutdown` flips or its sender drops.
///
/// Returns the number of passes started.
pub async fn run_periodic(
    handle: WatchHandle,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut passes = 0usize;
    loop {
        if *shutdown.borrow() {
            break;
        }

        passes += 1;
        tokio::select! {
            result = handle.refresh() => match result {
                Ok(_) => {}
                Err(WatchError::WorkerGone) => break,
                Err(err) => warn!(error = %err, "scheduled reconciliation failed"),
            },
            _ = shutdown.changed() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!(passes, "periodic reconciliation stopped");
    passes
}

/// Wall-clock alternative to [`run_periodic`]: each cron tick queues a pass.
pub async fn build_cron_scheduler(handle: WatchHandle, expr: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(expr, move |_uuid, _l| {
        let handle = handle.clone();
        Box::pin(async move {
            if let Err(err) = handle.request_refresh().await {
                warn!(error = %err, "cron tick could not queue a reconciliation pass");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {expr}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// A shutdown signal that flips on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "could not listen for interrupt");
                // Hold the sender so receivers do not read a closed channel as shutdown.
                std::future::pending::<()>().await;
                drop(tx);
            }
        }
    });
    rx
}
