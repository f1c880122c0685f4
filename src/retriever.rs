//! Retrieval engine: nearest-neighbour search turned into a bounded,
//! threshold-filtered list of [`RetrievedChunk`]s.
//!
//! # Algorithm
//!
//! 1. Blank questions return an empty list without touching the index.
//! 2. Reuse the cached index handle, opening one on first use.
//! 3. Search for `fetch_k` candidates.
//! 4. Resolve score semantics (`similarity`, `distance`, or `auto`).
//! 5. Keep candidates passing the configured threshold. Unscored
//!    candidates always pass.
//! 6. If that removed everything, fall back to the first `min_results`
//!    unfiltered candidates.
//! 7. Truncate to `top_k`.
//!
//! Filtering and truncation never reorder: output order is the index's
//! relevance order.
//!
//! # Handle lifecycle
//!
//! The handle sits behind an async `RwLock`. Searches clone the `Arc` under
//! a read lock and release it before any I/O. [`RetrievalEngine::rebuild`]
//! opens the replacement first and only then swaps it in under the write
//! lock, so concurrent searches see either the old or the new handle and a
//! failed rebuild leaves the old one serving.

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::RetrievalConfig;
use crate::index::{IndexHit, IndexProvider, VectorIndex};
use crate::models::{RetrievalQuery, RetrievedChunk};

/// Largest observed score still classified as a similarity under `auto`.
///
/// Similarity backends report values near `[0, 1]` or `[-1, 1]`; raw
/// distances routinely exceed 1. This is a tunable guess: deployments that
/// need deterministic behaviour set `score_type` explicitly.
pub const AUTO_DISTANCE_THRESHOLD: f64 = 1.5;

/// How candidate scores should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreType {
    /// Higher is better.
    Similarity,
    /// Lower is better.
    Distance,
    /// Classify each batch from its observed scores.
    Auto,
}

impl ScoreType {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "similarity" => Ok(ScoreType::Similarity),
            "distance" => Ok(ScoreType::Distance),
            "auto" => Ok(ScoreType::Auto),
            other => bail!("Unknown score type: {}", other),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScoreType::Similarity => "similarity",
            ScoreType::Distance => "distance",
            ScoreType::Auto => "auto",
        }
    }
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringPolicy {
    pub score_type: ScoreType,
    /// Similarity floor.
    pub min_score: Option<f64>,
    /// Distance ceiling.
    pub max_distance: Option<f64>,
    /// Result floor applied when filtering removes every candidate.
    pub min_results: usize,
    /// Candidates requested from the index.
    pub fetch_k: usize,
    /// Final cap after filtering.
    pub top_k: usize,
}

impl ScoringPolicy {
    pub fn from_config(config: &RetrievalConfig) -> Result<Self> {
        Ok(Self {
            score_type: ScoreType::parse(&config.score_type)?,
            min_score: config.min_score,
            max_distance: config.max_distance,
            min_results: config.min_results,
            fetch_k: config.effective_fetch_k(),
            top_k: config.top_k,
        })
    }
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            score_type: ScoreType::Auto,
            min_score: None,
            max_distance: None,
            min_results: 1,
            fetch_k: 5,
            top_k: 5,
        }
    }
}

/// Classify a batch of scores for `auto` mode.
///
/// Any score above [`AUTO_DISTANCE_THRESHOLD`] marks the batch as
/// distances. An empty batch is treated as similarities.
pub fn detect_score_type(scores: &[f64]) -> ScoreType {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max > AUTO_DISTANCE_THRESHOLD {
        ScoreType::Distance
    } else {
        ScoreType::Similarity
    }
}

/// Resolve `auto` against the scored candidates of one batch.
pub fn resolve_score_type(configured: ScoreType, hits: &[IndexHit]) -> ScoreType {
    match configured {
        ScoreType::Auto => {
            let scores: Vec<f64> = hits.iter().filter_map(|h| h.score).collect();
            detect_score_type(&scores)
        }
        explicit => explicit,
    }
}

/// Apply threshold filtering, the `min_results` safety net, and the
/// `top_k` cap to relevance-ordered hits.
pub fn select_hits(hits: Vec<IndexHit>, policy: &ScoringPolicy) -> Vec<IndexHit> {
    let score_type = resolve_score_type(policy.score_type, &hits);

    let threshold = match score_type {
        ScoreType::Similarity => policy.min_score,
        ScoreType::Distance => policy.max_distance,
        ScoreType::Auto => None,
    };

    let mut selected: Vec<IndexHit> = match threshold {
        Some(limit) => hits
            .iter()
            .filter(|h| h.score.map_or(true, |s| passes(score_type, s, limit)))
            .cloned()
            .collect(),
        None => hits.clone(),
    };

    if selected.is_empty() && !hits.is_empty() && policy.min_results > 0 {
        tracing::debug!(
            candidates = hits.len(),
            min_results = policy.min_results,
            "threshold removed every candidate; falling back to best unfiltered"
        );
        selected = hits.into_iter().take(policy.min_results).collect();
    }

    selected.truncate(policy.top_k);
    selected
}

fn passes(score_type: ScoreType, score: f64, limit: f64) -> bool {
    match score_type {
        ScoreType::Distance => score <= limit,
        _ => score >= limit,
    }
}

/// Owns the index handle and turns questions into ranked chunks.
pub struct RetrievalEngine {
    provider: Arc<dyn IndexProvider>,
    policy: ScoringPolicy,
    debug: bool,
    handle: RwLock<Option<Arc<dyn VectorIndex>>>,
}

impl RetrievalEngine {
    pub fn new(provider: Arc<dyn IndexProvider>, policy: ScoringPolicy) -> Self {
        Self {
            provider,
            policy,
            debug: false,
            handle: RwLock::new(None),
        }
    }

    pub fn from_config(provider: Arc<dyn IndexProvider>, config: &RetrievalConfig) -> Result<Self> {
        let mut engine = Self::new(provider, ScoringPolicy::from_config(config)?);
        engine.debug = config.debug;
        Ok(engine)
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Fetch ranked chunks for `query`, most relevant first, at most `top_k`.
    pub async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<RetrievedChunk>> {
        let question = query.question.trim();
        if question.is_empty() {
            return Ok(Vec::new());
        }

        let index = self.index().await?;
        let hits = index.search(question, self.policy.fetch_k).await?;
        let candidates = hits.len();

        if self.debug {
            let score_type = resolve_score_type(self.policy.score_type, &hits);
            tracing::debug!(
                user = %query.user,
                fetch_k = self.policy.fetch_k,
                top_k = self.policy.top_k,
                score_type = score_type.as_str(),
                min_score = ?self.policy.min_score,
                max_distance = ?self.policy.max_distance,
                candidates,
                "retrieval candidates"
            );
            for (i, hit) in hits.iter().take(10).enumerate() {
                let preview: String = hit.text.chars().take(80).collect();
                tracing::debug!(
                    rank = i + 1,
                    score = ?hit.score,
                    source = source_label(hit),
                    preview = %preview.replace('\n', " "),
                    "candidate"
                );
            }
        }

        let selected = select_hits(hits, &self.policy);
        tracing::debug!(candidates, returned = selected.len(), "retrieval done");

        Ok(selected
            .into_iter()
            .map(|hit| RetrievedChunk {
                text: hit.text,
                score: hit.score,
                metadata: hit.metadata,
            })
            .collect())
    }

    /// Drop the cached handle; the next search reconnects.
    pub async fn invalidate(&self) {
        *self.handle.write().await = None;
    }

    /// Open a fresh handle and swap it in. On failure the previous handle
    /// stays in place and the error is returned.
    pub async fn rebuild(&self) -> Result<()> {
        let fresh = self.provider.open().await?;
        *self.handle.write().await = Some(fresh);
        Ok(())
    }

    async fn index(&self) -> Result<Arc<dyn VectorIndex>> {
        if let Some(index) = self.handle.read().await.as_ref() {
            return Ok(index.clone());
        }

        let mut guard = self.handle.write().await;
        if let Some(index) = guard.as_ref() {
            return Ok(index.clone());
        }
        let index = self.provider.open().await?;
        *guard = Some(index.clone());
        Ok(index)
    }
}

fn source_label(hit: &IndexHit) -> &str {
    hit.metadata
        .get("source_file")
        .or_else(|| hit.metadata.get("file_name"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
}
