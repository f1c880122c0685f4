//! Orchestrator: retrieved chunks → cited context → chat messages →
//! model call → normalized answer.
//!
//! # Prompt layout
//!
//! Messages are always, in order:
//!
//! 1. one system turn (the resolved system prompt),
//! 2. the caller's prior turns, verbatim,
//! 3. one user turn: `QUESTION:\n<question>\n\nCONTEXT:\n<context block>`.
//!
//! The context block numbers each chunk `[i] source_file=<name>` starting
//! at 1, in retrieval order. Citation `i` in the returned sources is built
//! in the same pass, so `[i]` markers in an answer always point at
//! `sources[i - 1]`.
//!
//! When no usable chunk remains, the model is not called at all: the
//! result is [`NO_DOCUMENTS_ANSWER`] with zero usage and no sources.

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::llm::{ChatClient, RawUsage};
use crate::models::{
    Citation, ConversationTurn, OrchestratorResult, RetrievalQuery, RetrievedChunk, Usage,
};
use crate::prompt::{load_system_prompt, resolve_prompt_name, PromptStore};
use crate::retriever::RetrievalEngine;

/// Answer returned when retrieval yields nothing.
pub const NO_DOCUMENTS_ANSWER: &str = "No document found for this query.";

/// Separator between context segments.
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Sampling temperature used unless configured otherwise.
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// One question to answer.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorInput {
    pub user: String,
    pub question: String,
    pub model: String,
    pub session_id: Option<String>,
    /// Prior turns, inserted between the system prompt and the question.
    pub history: Vec<ConversationTurn>,
}

pub struct Orchestrator {
    retriever: Arc<RetrievalEngine>,
    chat: Arc<dyn ChatClient>,
    system_prompt: String,
    top_k: usize,
    temperature: f32,
}

impl Orchestrator {
    pub fn new(
        retriever: Arc<RetrievalEngine>,
        chat: Arc<dyn ChatClient>,
        system_prompt: impl Into<String>,
        top_k: usize,
    ) -> Self {
        Self {
            retriever,
            chat,
            system_prompt: system_prompt.into(),
            top_k,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Build from configuration, loading the system prompt from `prompts`.
    ///
    /// Priority: `system_prompt_override` > configured template > fallback.
    pub fn from_config(
        config: &Config,
        retriever: Arc<RetrievalEngine>,
        chat: Arc<dyn ChatClient>,
        prompts: &dyn PromptStore,
        system_prompt_override: Option<String>,
    ) -> Self {
        let system_prompt = system_prompt_override
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| {
                load_system_prompt(prompts, resolve_prompt_name(config.prompts.system.as_deref()))
            });
        Self::new(retriever, chat, system_prompt, config.retrieval.top_k)
            .with_temperature(config.chat.temperature)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn retriever(&self) -> &Arc<RetrievalEngine> {
        &self.retriever
    }

    /// Answer one question. Retrieval and model errors propagate unchanged.
    pub async fn run(&self, input: &OrchestratorInput) -> Result<OrchestratorResult> {
        let query = RetrievalQuery {
            user: input.user.clone(),
            question: input.question.clone(),
            model: Some(input.model.clone()),
        };

        let mut chunks: Vec<RetrievedChunk> = self
            .retriever
            .retrieve(&query)
            .await?
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .collect();
        chunks.truncate(self.top_k);

        if chunks.is_empty() {
            tracing::info!(user = %input.user, "no chunks retrieved; skipping model call");
            return Ok(OrchestratorResult {
                answer: NO_DOCUMENTS_ANSWER.to_string(),
                usage: Usage::default(),
                sources: Vec::new(),
            });
        }

        let (context_block, sources) = format_context(&chunks);
        let messages = build_messages(&self.system_prompt, input, &context_block);

        tracing::debug!(
            user = %input.user,
            session = ?input.session_id,
            model = %input.model,
            chunks = chunks.len(),
            messages = messages.len(),
            "calling chat model"
        );

        let completion = self
            .chat
            .chat(&input.model, &messages, self.temperature)
            .await?;

        Ok(OrchestratorResult {
            answer: completion.content,
            usage: normalize_usage(completion.usage),
            sources,
        })
    }
}

/// Render chunks as numbered context segments plus matching citations.
pub fn format_context(chunks: &[RetrievedChunk]) -> (String, Vec<Citation>) {
    let mut parts = Vec::with_capacity(chunks.len());
    let mut sources = Vec::with_capacity(chunks.len());

    for (i, chunk) in chunks.iter().enumerate() {
        let reference = i + 1;
        let source_file = metadata_str(chunk, &["source_file", "file_name"])
            .unwrap_or_else(|| "unknown".to_string());
        let source_path =
            metadata_str(chunk, &["source_path", "file_path"]).unwrap_or_default();

        parts.push(format!(
            "[{}] source_file={}\n{}",
            reference,
            source_file,
            chunk.text.trim()
        ));
        sources.push(Citation {
            reference,
            source_file,
            source_path,
            score: chunk.score,
            metadata: chunk.metadata.clone(),
        });
    }

    (parts.join(CONTEXT_SEPARATOR), sources)
}

/// System turn, then history, then the question-and-context turn.
pub fn build_messages(
    system_prompt: &str,
    input: &OrchestratorInput,
    context_block: &str,
) -> Vec<ConversationTurn> {
    let mut messages = Vec::with_capacity(input.history.len() + 2);
    messages.push(ConversationTurn::system(system_prompt));
    messages.extend(input.history.iter().cloned());
    messages.push(ConversationTurn::user(format!(
        "QUESTION:\n{}\n\nCONTEXT:\n{}",
        input.question, context_block
    )));
    messages
}

/// Missing or negative counters become zero.
pub fn normalize_usage(raw: Option<RawUsage>) -> Usage {
    let raw = raw.unwrap_or_default();
    let count = |v: Option<i64>| v.unwrap_or(0).max(0) as u64;
    Usage {
        prompt_tokens: count(raw.prompt_tokens),
        completion_tokens: count(raw.completion_tokens),
        total_tokens: count(raw.total_tokens),
    }
}

/// First non-empty metadata value among `keys`, rendered as text.
fn metadata_str(chunk: &RetrievedChunk, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match chunk.metadata.get(*key) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_json::Value::Null) | Some(serde_json::Value::String(_)) | None => None,
        Some(other) => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::StaticIndexProvider;
    use crate::index::IndexHit;
    use crate::llm::ChatCompletion;
    use crate::models::{Metadata, Role};
    use crate::prompt::FALLBACK_SYSTEM_PROMPT;
    use crate::retriever::{ScoreType, ScoringPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubChat {
        calls: AtomicUsize,
        seen: Mutex<Vec<(String, Vec<ConversationTurn>, f32)>>,
        usage: Option<RawUsage>,
    }

    impl StubChat {
        fn new(usage: Option<RawUsage>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                usage,
            }
        }
    }

    #[async_trait]
    impl ChatClient for StubChat {
        async fn chat(
            &self,
            model: &str,
            messages: &[ConversationTurn],
            temperature: f32,
        ) -> Result<ChatCompletion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((model.to_string(), messages.to_vec(), temperature));
            Ok(ChatCompletion {
                content: "Answer [1].".to_string(),
                usage: self.usage,
            })
        }
    }

    struct FailingChat;

    #[async_trait]
    impl ChatClient for FailingChat {
        async fn chat(&self, _: &str, _: &[ConversationTurn], _: f32) -> Result<ChatCompletion> {
            anyhow::bail!("connection refused")
        }
    }

    fn chunk(text: &str, file: Option<&str>, score: Option<f64>) -> RetrievedChunk {
        let mut metadata = Metadata::new();
        if let Some(file) = file {
            metadata.insert("source_file".into(), file.into());
            metadata.insert("source_path".into(), format!("/data/{}", file).into());
        }
        RetrievedChunk {
            text: text.to_string(),
            score,
            metadata,
        }
    }

    fn hit(text: &str, file: &str, score: f64) -> IndexHit {
        let mut metadata = Metadata::new();
        metadata.insert("file_name".into(), file.into());
        IndexHit::new(text, metadata, Some(score))
    }

    fn engine(hits: Vec<IndexHit>, top_k: usize) -> Arc<RetrievalEngine> {
        let policy = ScoringPolicy {
            score_type: ScoreType::Similarity,
            min_score: None,
            max_distance: None,
            min_results: 1,
            fetch_k: 10,
            top_k,
        };
        Arc::new(RetrievalEngine::new(
            Arc::new(StaticIndexProvider::new(hits)),
            policy,
        ))
    }

    fn input(question: &str) -> OrchestratorInput {
        OrchestratorInput {
            user: "alice".into(),
            question: question.into(),
            model: "gpt-test".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_format_context_numbering_matches_sources() {
        let chunks = vec![
            chunk("  First passage.\n", Some("a.txt"), Some(0.9)),
            chunk("Second passage.", None, None),
        ];
        let (block, sources) = format_context(&chunks);

        assert_eq!(
            block,
            "[1] source_file=a.txt\nFirst passage.\n\n---\n\n[2] source_file=unknown\nSecond passage."
        );
        assert_eq!(sources.len(), 2);
        for (i, source) in sources.iter().enumerate() {
            assert_eq!(source.reference, i + 1);
            assert!(block.contains(&format!("[{}] source_file={}", i + 1, source.source_file)));
        }
        assert_eq!(sources[0].source_path, "/data/a.txt");
        assert_eq!(sources[0].score, Some(0.9));
        assert_eq!(sources[1].source_path, "");
    }

    #[test]
    fn test_format_context_metadata_fallbacks() {
        let mut metadata = Metadata::new();
        metadata.insert("file_name".into(), "b.csv".into());
        metadata.insert("file_path".into(), "raw/b.csv".into());
        let c = RetrievedChunk {
            text: "x".into(),
            score: None,
            metadata,
        };
        let (_, sources) = format_context(&[c]);
        assert_eq!(sources[0].source_file, "b.csv");
        assert_eq!(sources[0].source_path, "raw/b.csv");
    }

    #[test]
    fn test_build_messages_order() {
        let mut orch_in = input("What is X?");
        orch_in.history = vec![
            ConversationTurn::user("earlier"),
            ConversationTurn::assistant("reply"),
        ];
        let messages = build_messages("SYS", &orch_in, "[1] source_file=a\nctx");

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], ConversationTurn::system("SYS"));
        assert_eq!(messages[1].content, "earlier");
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[3].role, Role::User);
        assert_eq!(
            messages[3].content,
            "QUESTION:\nWhat is X?\n\nCONTEXT:\n[1] source_file=a\nctx"
        );
    }

    #[test]
    fn test_normalize_usage_defaults_to_zero() {
        assert_eq!(normalize_usage(None), Usage::default());
        let usage = normalize_usage(Some(RawUsage {
            prompt_tokens: Some(10),
            completion_tokens: None,
            total_tokens: Some(-3),
        }));
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn test_empty_retrieval_skips_model() {
        let chat = Arc::new(StubChat::new(None));
        let orch = Orchestrator::new(engine(Vec::new(), 5), chat.clone(), "SYS", 5);

        let result = orch.run(&input("anything")).await.unwrap();
        assert_eq!(result.answer, NO_DOCUMENTS_ANSWER);
        assert_eq!(result.usage, Usage::default());
        assert!(result.sources.is_empty());
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blank_chunks_are_dropped() {
        let chat = Arc::new(StubChat::new(None));
        let hits = vec![hit("", "a.txt", 0.9), hit("  \n", "b.txt", 0.8)];
        let orch = Orchestrator::new(engine(hits, 5), chat.clone(), "SYS", 5);

        let result = orch.run(&input("q")).await.unwrap();
        assert_eq!(result.answer, NO_DOCUMENTS_ANSWER);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_assembles_prompt_and_normalizes() {
        let chat = Arc::new(StubChat::new(Some(RawUsage {
            prompt_tokens: Some(40),
            completion_tokens: Some(5),
            total_tokens: None,
        })));
        let hits = vec![
            hit("Alpha text", "alpha.txt", 0.9),
            hit("Beta text", "beta.txt", 0.7),
            hit("Gamma text", "gamma.txt", 0.5),
        ];
        // Orchestrator cap is tighter than the engine's.
        let orch = Orchestrator::new(engine(hits, 3), chat.clone(), "SYS", 2)
            .with_temperature(0.1);

        let result = orch.run(&input("Tell me")).await.unwrap();
        assert_eq!(result.answer, "Answer [1].");
        assert_eq!(result.usage.prompt_tokens, 40);
        assert_eq!(result.usage.completion_tokens, 5);
        assert_eq!(result.usage.total_tokens, 0);
        assert_eq!(result.sources.len(), 2);
        assert_eq!(result.sources[0].source_file, "alpha.txt");
        assert_eq!(result.sources[1].reference, 2);

        let seen = chat.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (model, messages, temperature) = &seen[0];
        assert_eq!(model, "gpt-test");
        assert!((temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "SYS");
        assert_eq!(
            messages[1].content,
            "QUESTION:\nTell me\n\nCONTEXT:\n[1] source_file=alpha.txt\nAlpha text\n\n---\n\n[2] source_file=beta.txt\nBeta text"
        );
    }

    #[tokio::test]
    async fn test_chat_failure_propagates() {
        let hits = vec![hit("Alpha", "a.txt", 0.9)];
        let orch = Orchestrator::new(engine(hits, 5), Arc::new(FailingChat), "SYS", 5);
        let err = orch.run(&input("q")).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_from_config_prompt_priority() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("custom.txt"), "From file\n").unwrap();
        let store = crate::prompt::FsPromptStore::new(tmp.path());
        let chat: Arc<dyn ChatClient> = Arc::new(StubChat::new(None));

        let mut config = Config::default();
        config.prompts.system = Some("custom.txt".into());

        let from_file =
            Orchestrator::from_config(&config, engine(Vec::new(), 5), chat.clone(), &store, None);
        assert_eq!(from_file.system_prompt(), "From file");

        let overridden = Orchestrator::from_config(
            &config,
            engine(Vec::new(), 5),
            chat.clone(),
            &store,
            Some("Override".into()),
        );
        assert_eq!(overridden.system_prompt(), "Override");

        config.prompts.system = Some("missing.txt".into());
        let fallback =
            Orchestrator::from_config(&config, engine(Vec::new(), 5), chat, &store, None);
        assert_eq!(fallback.system_prompt(), FALLBACK_SYSTEM_PROMPT);
    }
}
