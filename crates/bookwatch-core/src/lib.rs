//! Core domain model for bookwatch: tracked books, the catalog and price changes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "bookwatch-core";

/// Placeholder used when a listing page carries no title element.
pub const UNKNOWN_TITLE: &str = "Unknown Title";

/// One tracked book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub isbn: String,
    /// Last observed price in GBP.
    pub last_price: Decimal,
    /// Best-effort cache of the last seen display title; empty until resolved.
    #[serde(default)]
    pub title: String,
}

impl CatalogEntry {
    pub fn new(isbn: impl Into<String>, last_price: Decimal) -> Self {
        Self {
            isbn: isbn.into(),
            last_price,
            title: String::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Title for display, falling back to the ISBN when nothing was resolved yet.
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.isbn
        } else {
            &self.title
        }
    }
}

/// Column layout of the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CatalogFormat {
    /// `ISBN,Price`
    IsbnPrice,
    /// `ISBN,Price,Title`
    #[default]
    IsbnPriceTitle,
}

impl CatalogFormat {
    pub fn headers(self) -> &'static [&'static str] {
        match self {
            Self::IsbnPrice => &["ISBN", "Price"],
            Self::IsbnPriceTitle => &["ISBN", "Price", "Title"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ISBN {0} is already in the catalog")]
pub struct DuplicateIsbn(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid ISBN {0:?}: expected letters, digits or '-'")]
pub struct InvalidIsbn(pub String);

/// Trim user input and check it is safe to embed in a lookup URL path.
pub fn normalize_isbn(raw: &str) -> Result<String, InvalidIsbn> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(InvalidIsbn(raw.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Ordered set of tracked books, in file order.
///
/// ISBN uniqueness is enforced by [`Catalog::insert`] only; a file containing
/// duplicates still loads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub format: CatalogFormat,
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(format: CatalogFormat) -> Self {
        Self {
            format,
            entries: Vec::new(),
        }
    }

    pub fn from_entries(format: CatalogFormat, entries: Vec<CatalogEntry>) -> Self {
        Self { format, entries }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [CatalogEntry] {
        &mut self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, isbn: &str) -> bool {
        self.entries.iter().any(|e| e.isbn == isbn)
    }

    pub fn get(&self, isbn: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.isbn == isbn)
    }

    pub fn get_mut(&mut self, isbn: &str) -> Option<&mut CatalogEntry> {
        self.entries.iter_mut().find(|e| e.isbn == isbn)
    }

    /// Append an entry, rejecting an ISBN that is already tracked.
    pub fn insert(&mut self, entry: CatalogEntry) -> Result<(), DuplicateIsbn> {
        if self.contains(&entry.isbn) {
            return Err(DuplicateIsbn(entry.isbn));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Remove by ISBN, returning the old position so the removal can be undone.
    pub fn remove(&mut self, isbn: &str) -> Option<(usize, CatalogEntry)> {
        let idx = self.entries.iter().position(|e| e.isbn == isbn)?;
        Some((idx, self.entries.remove(idx)))
    }

    /// Undo a [`Catalog::remove`].
    pub fn restore(&mut self, index: usize, entry: CatalogEntry) {
        let index = index.min(self.entries.len());
        self.entries.insert(index, entry);
    }
}

/// A detected price movement for one book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChange {
    pub isbn: String,
    pub title: String,
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub listing_url: String,
}

impl PriceChange {
    /// Alert text shown to the user.
    pub fn message(&self) -> String {
        format!(
            "{}\nOld: £{:.2}\nNew: £{:.2}",
            self.title, self.old_price, self.new_price
        )
    }
}

/// Format an amount the way the catalog file and UI show it.
pub fn format_price(price: Decimal) -> String {
    format!("{price:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(isbn: &str, cents: i64) -> CatalogEntry {
        CatalogEntry::new(isbn, Decimal::new(cents, 2))
    }

    #[test]
    fn insert_rejects_duplicate_without_mutation() {
        let mut catalog = Catalog::new(CatalogFormat::IsbnPriceTitle);
        catalog.insert(entry("111", 1000)).unwrap();
        let before = catalog.clone();

        let err = catalog.insert(entry("111", 2000)).unwrap_err();
        assert_eq!(err, DuplicateIsbn("111".to_string()));
        assert_eq!(catalog, before);
    }

    #[test]
    fn remove_and_restore_keep_file_order() {
        let mut catalog = Catalog::from_entries(
            CatalogFormat::IsbnPrice,
            vec![entry("a", 100), entry("b", 200), entry("c", 300)],
        );
        let (idx, removed) = catalog.remove("b").unwrap();
        assert_eq!(idx, 1);
        assert!(!catalog.contains("b"));
        assert!(catalog.remove("zzz").is_none());

        catalog.restore(idx, removed);
        let order: Vec<_> = catalog.iter().map(|e| e.isbn.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn price_change_message_uses_two_decimals() {
        let change = PriceChange {
            isbn: "111".into(),
            title: "Dune".into(),
            old_price: Decimal::new(10, 0),
            new_price: Decimal::new(125, 1),
            listing_url: "https://example.test/111".into(),
        };
        assert_eq!(change.message(), "Dune\nOld: £10.00\nNew: £12.50");
    }

    #[test]
    fn isbn_normalization_trims_and_rejects_path_characters() {
        assert_eq!(normalize_isbn("  978-0141439518 ").unwrap(), "978-0141439518");
        assert_eq!(normalize_isbn("043942089X").unwrap(), "043942089X");
        assert!(normalize_isbn("   ").is_err());
        assert!(normalize_isbn("123/../456").is_err());
    }

    #[test]
    fn display_title_falls_back_to_isbn() {
        let e = entry("111", 100);
        assert_eq!(e.display_title(), "111");
        assert_eq!(e.with_title("Emma").display_title(), "Emma");
    }
}
