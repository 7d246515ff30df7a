//! Bookseller price source contract + the AbeBooks search-results adapter.

use std::str::FromStr;

use async_trait::async_trait;
use bookwatch_core::UNKNOWN_TITLE;
use bookwatch_storage::{FetchError, HttpFetcher};
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "bookwatch-adapters";

pub const DEFAULT_BASE_URL: &str = "https://www.abebooks.co.uk/book-search/isbn";
pub const DEFAULT_SEARCH_SUFFIX: &str = "100121502";

pub const TITLE_SELECTOR: &str = r#"span[data-test-id="listing-title"]"#;
pub const PRICE_SELECTOR: &str = "p.item-price#item-price-1";

/// Mis-encoded renderings of the pound sign seen in scraped prices.
const POUND_VARIANTS: &[char] = &['Ł'];

/// What one lookup yields for an ISBN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub title: String,
    pub price: Decimal,
    pub listing_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupErrorKind {
    Network,
    HttpStatus,
    PriceNotFound,
    PriceParse,
    Selector,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("network error for ISBN {isbn}: {source}")]
    Network {
        isbn: String,
        #[source]
        source: FetchError,
    },
    #[error("http status {status} for ISBN {isbn} ({url})")]
    HttpStatus {
        isbn: String,
        status: u16,
        url: String,
    },
    #[error("price not found for ISBN {isbn}")]
    PriceNotFound { isbn: String },
    #[error("could not parse price {raw:?} for ISBN {isbn}")]
    PriceParse { isbn: String, raw: String },
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

impl LookupError {
    pub fn from_fetch(isbn: &str, err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, url } => Self::HttpStatus {
                isbn: isbn.to_string(),
                status,
                url,
            },
            other @ FetchError::Request(_) => Self::Network {
                isbn: isbn.to_string(),
                source: other,
            },
        }
    }

    pub fn kind(&self) -> LookupErrorKind {
        match self {
            Self::Network { .. } => LookupErrorKind::Network,
            Self::HttpStatus { .. } => LookupErrorKind::HttpStatus,
            Self::PriceNotFound { .. } => LookupErrorKind::PriceNotFound,
            Self::PriceParse { .. } => LookupErrorKind::PriceParse,
            Self::Selector { .. } => LookupErrorKind::Selector,
        }
    }
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Public page for an ISBN, shown to the user for manual inspection.
    fn listing_url(&self, isbn: &str) -> String;

    async fn fetch(&self, isbn: &str) -> Result<Listing, LookupError>;
}

#[derive(Debug, Clone)]
pub struct AbeBooksSource {
    http: HttpFetcher,
    base_url: String,
    suffix: String,
}

impl AbeBooksSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            suffix: DEFAULT_SEARCH_SUFFIX.to_string(),
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }
}

#[async_trait]
impl PriceSource for AbeBooksSource {
    fn listing_url(&self, isbn: &str) -> String {
        format!(
            "{}/{}/n/{}",
            self.base_url.trim_end_matches('/'),
            isbn,
            self.suffix
        )
    }

    async fn fetch(&self, isbn: &str) -> Result<Listing, LookupError> {
        let url = self.listing_url(isbn);
        let response = self
            .http
            .fetch_text(&url)
            .await
            .map_err(|err| LookupError::from_fetch(isbn, err))?;
        debug!(isbn, status = %response.status, bytes = response.body.len(), "fetched listing page");
        parse_listing(isbn, &response.body, url)
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, LookupError> {
    let sel = Selector::parse(selector).map_err(|e| LookupError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

/// Extract title and price from a search-results document.
///
/// A missing title falls back to [`UNKNOWN_TITLE`]; a missing price is an error.
pub fn parse_listing(isbn: &str, html: &str, listing_url: String) -> Result<Listing, LookupError> {
    let document = Html::parse_document(html);
    let title = select_first_text(&document, TITLE_SELECTOR)?
        .unwrap_or_else(|| UNKNOWN_TITLE.to_string());
    let raw_price = select_first_text(&document, PRICE_SELECTOR)?.ok_or_else(|| {
        LookupError::PriceNotFound {
            isbn: isbn.to_string(),
        }
    })?;
    let price = normalize_price(&raw_price).ok_or_else(|| LookupError::PriceParse {
        isbn: isbn.to_string(),
        raw: raw_price.clone(),
    })?;
    Ok(Listing {
        title,
        price,
        listing_url,
    })
}

/// Turn scraped price text such as `"£1,234.50"` into a decimal amount.
pub fn normalize_price(raw: &str) -> Option<Decimal> {
    let canonical: String = raw
        .chars()
        .map(|c| if POUND_VARIANTS.contains(&c) { '£' } else { c })
        .filter(|c| *c != '£' && *c != ',')
        .collect();
    Decimal::from_str(canonical.trim()).ok()
}
