//! Flat-file catalog storage + HTTP fetch utilities for bookwatch.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use bookwatch_core::{format_price, Catalog, CatalogEntry, CatalogFormat};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bookwatch-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.5615.137 Safari/537.36";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading catalog {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("catalog {} has no {column} column", .path.display())]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("invalid price {value:?} for ISBN {isbn} on line {line} of {}", .path.display())]
    InvalidPrice {
        path: PathBuf,
        line: u64,
        isbn: String,
        value: String,
    },
}

/// CSV-backed catalog file. The whole file is read and rewritten on every call.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the catalog, creating an empty file with a header when it is absent.
    pub async fn load(&self) -> Result<Catalog, CatalogError> {
        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|source| self.io_error(source))?;
        if !exists {
            let empty = Catalog::new(CatalogFormat::default());
            self.save(&empty).await?;
            debug!(path = %self.path.display(), "created empty catalog");
            return Ok(empty);
        }

        let bytes = fs::read(&self.path)
            .await
            .map_err(|source| self.io_error(source))?;
        self.parse(&bytes)
    }

    fn parse(&self, bytes: &[u8]) -> Result<Catalog, CatalogError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(bytes);

        let headers = reader
            .headers()
            .map_err(|source| self.csv_error(source))?
            .clone();
        let column = |name: &'static str| headers.iter().position(|h| h == name);
        let isbn_idx = column("ISBN").ok_or_else(|| self.missing_column("ISBN"))?;
        let price_idx = column("Price").ok_or_else(|| self.missing_column("Price"))?;
        let title_idx = column("Title");
        let format = if title_idx.is_some() {
            CatalogFormat::IsbnPriceTitle
        } else {
            CatalogFormat::IsbnPrice
        };

        let mut entries = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|source| self.csv_error(source))?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let isbn = record.get(isbn_idx).unwrap_or("").to_string();
            let raw_price = record.get(price_idx).unwrap_or("");
            let last_price =
                Decimal::from_str(raw_price).map_err(|_| CatalogError::InvalidPrice {
                    path: self.path.clone(),
                    line,
                    isbn: isbn.clone(),
                    value: raw_price.to_string(),
                })?;
            let title = title_idx
                .and_then(|idx| record.get(idx))
                .unwrap_or("")
                .to_string();
            entries.push(CatalogEntry {
                isbn,
                last_price,
                title,
            });
        }

        Ok(Catalog::from_entries(format, entries))
    }

    fn render(&self, catalog: &Catalog) -> Result<Vec<u8>, CatalogError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(catalog.format.headers())
            .map_err(|source| self.csv_error(source))?;
        for entry in catalog.iter() {
            let price = format_price(entry.last_price);
            let result = match catalog.format {
                CatalogFormat::IsbnPrice => writer.write_record([entry.isbn.as_str(), price.as_str()]),
                CatalogFormat::IsbnPriceTitle => {
                    writer.write_record([entry.isbn.as_str(), price.as_str(), entry.title.as_str()])
                }
            };
            result.map_err(|source| self.csv_error(source))?;
        }
        writer
            .into_inner()
            .map_err(|err| self.io_error(err.into_error()))
    }

    /// Replace the backing file via a temp file in the same directory and a rename.
    pub async fn save(&self, catalog: &Catalog) -> Result<(), CatalogError> {
        let bytes = self.render(catalog)?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(dir) = &dir {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| self.io_error(source))?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "catalog".to_string());
        let temp_name = format!(".{file_name}.{}.tmp", Uuid::new_v4());
        let temp_path = match &dir {
            Some(dir) => dir.join(temp_name),
            None => PathBuf::from(temp_name),
        };

        if let Err(err) = write_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(err));
        }
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> CatalogError {
        CatalogError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn csv_error(&self, source: csv::Error) -> CatalogError {
        CatalogError::Csv {
            path: self.path.clone(),
            source,
        }
    }

    fn missing_column(&self, column: &'static str) -> CatalogError {
        CatalogError::MissingColumn {
            path: self.path.clone(),
            column,
        }
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Single-shot HTTP GET client. No retries: a failed request is reported as-is.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.text().await?;
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
