//! Core data models used throughout the retrieval and answer pipeline.
//!
//! These types represent the queries, retrieved passages, chat turns, and
//! answers that flow from the retrieval engine through the orchestrator to
//! the HTTP layer.

use serde::{Deserialize, Serialize};

/// Chunk metadata: string keys mapped to scalar JSON values
/// (`source_file`, `source_path`, `doc_id`, `ingested_at`, ...).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A single retrieval request, built once per incoming question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalQuery {
    pub user: String,
    pub question: String,
    /// Model override requested by the caller, if any.
    pub model: Option<String>,
}

impl RetrievalQuery {
    pub fn new(user: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            question: question.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A passage returned by the retrieval engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub text: String,
    /// Raw relevance signal; polarity depends on the resolved score type.
    pub score: Option<f64>,
    pub metadata: Metadata,
}

/// Message author. Roles other than the three the pipeline produces
/// (`tool`, `developer`, ...) are carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    #[serde(untagged)]
    Other(String),
}

/// One message of a chat exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token accounting for one answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Citation for segment `[ref]` of the context block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    /// 1-based, matches the `[i]` marker in the context block.
    #[serde(rename = "ref")]
    pub reference: usize,
    pub source_file: String,
    pub source_path: String,
    pub score: Option<f64>,
    pub metadata: Metadata,
}

/// The orchestrator's answer for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorResult {
    pub answer: String,
    pub usage: Usage,
    pub sources: Vec<Citation>,
}
