//! In-memory [`VectorIndex`] returning a fixed, pre-ranked hit list.
//!
//! Ignores the query text: `search` returns the first `k` stored hits.
//! [`StaticIndexProvider`] snapshots its current hit list into every handle
//! it opens, so replacing the hits only becomes visible after a reopen,
//! the same way a cached handle on a real store goes stale.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{IndexHit, IndexProvider, VectorIndex};

pub struct StaticIndex {
    hits: Vec<IndexHit>,
    searches: Arc<AtomicUsize>,
}

impl StaticIndex {
    pub fn new(hits: Vec<IndexHit>) -> Self {
        Self {
            hits,
            searches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for StaticIndex {
    async fn search(&self, _query: &str, k: usize) -> Result<Vec<IndexHit>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.iter().take(k).cloned().collect())
    }
}

/// Provider handing out [`StaticIndex`] snapshots.
pub struct StaticIndexProvider {
    hits: RwLock<Vec<IndexHit>>,
    opens: AtomicUsize,
    searches: Arc<AtomicUsize>,
    fail_open: AtomicBool,
}

impl StaticIndexProvider {
    pub fn new(hits: Vec<IndexHit>) -> Self {
        Self {
            hits: RwLock::new(hits),
            opens: AtomicUsize::new(0),
            searches: Arc::new(AtomicUsize::new(0)),
            fail_open: AtomicBool::new(false),
        }
    }

    /// Replace the corpus seen by handles opened from now on.
    pub fn set_hits(&self, hits: Vec<IndexHit>) {
        let mut guard = self.hits.write().unwrap_or_else(|e| e.into_inner());
        *guard = hits;
    }

    /// Make subsequent `open` calls fail, simulating an unreachable store.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Searches across every handle this provider has opened.
    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexProvider for StaticIndexProvider {
    async fn open(&self) -> Result<Arc<dyn VectorIndex>> {
        if self.fail_open.load(Ordering::SeqCst) {
            bail!("vector store unreachable");
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let hits = self.hits.read().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(Arc::new(StaticIndex {
            hits,
            searches: self.searches.clone(),
        }))
    }
}
