//! Vector index abstraction.
//!
//! The retrieval engine talks to the vector store only through these two
//! traits:
//!
//! - [`IndexProvider::open`] connects to a fixed collection (creating it
//!   when missing) and returns a live handle.
//! - [`VectorIndex::search`] returns the `k` nearest neighbours of a query
//!   text, best first.
//!
//! Raw store rows are decoded into [`IndexHit`]s once, at this boundary,
//! so retrieval logic never deals with malformed metadata or scores.
//!
//! Implementations:
//!
//! | Type | Backing |
//! |------|---------|
//! | [`sqlite::SqliteCollection`] | SQLite table of embedding blobs, brute-force scoring |
//! | [`memory::StaticIndex`] | Fixed in-memory hit list |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::models::Metadata;

/// One nearest-neighbour search result.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub text: String,
    pub metadata: Metadata,
    /// `None` when the backend reported no usable numeric score.
    pub score: Option<f64>,
}

impl IndexHit {
    pub fn new(text: impl Into<String>, metadata: Metadata, score: Option<f64>) -> Self {
        Self {
            text: text.into(),
            metadata,
            score: score.filter(|s| s.is_finite()),
        }
    }

    /// Decode a stored row. Metadata that is not a JSON object becomes an
    /// empty map; NaN and infinite scores become `None`.
    pub fn decode(text: String, metadata_json: &str, score: Option<f64>) -> Self {
        let metadata = match serde_json::from_str::<serde_json::Value>(metadata_json) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Metadata::new(),
        };
        Self::new(text, metadata, score)
    }
}

/// A live handle on one collection of the vector store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `k` hits for `query`, most relevant first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<IndexHit>>;
}

/// Opens handles on the configured collection.
#[async_trait]
pub trait IndexProvider: Send + Sync {
    /// Connect and return a fresh handle. A missing collection is created
    /// empty rather than reported as an error.
    async fn open(&self) -> Result<Arc<dyn VectorIndex>>;
}
