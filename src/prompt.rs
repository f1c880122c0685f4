//! System-prompt templates.
//!
//! Templates are plain text files looked up by name through a
//! [`PromptStore`]. A missing or blank template never leaves the
//! orchestrator without instructions: [`load_system_prompt`] falls back to
//! [`FALLBACK_SYSTEM_PROMPT`].

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Template used when `[prompts].system` is not set.
pub const DEFAULT_PROMPT_NAME: &str = "default_system_prompt.txt";

/// Instructions used when the configured template is missing or empty.
pub const FALLBACK_SYSTEM_PROMPT: &str = "You are a RAG assistant.\n\n\
Rules (must follow):\n\
1) Use ONLY the information present in the provided CONTEXT.\n\
2) If the answer is not explicitly stated in the CONTEXT, reply: \
\"I don't know from the given context.\"\n\
3) Do NOT add outside knowledge, examples, analogies, or background.\n\
4) Keep the answer concise and factual.\n\
5) If relevant, include short citations of the document.";

/// Source of prompt template text.
pub trait PromptStore: Send + Sync {
    /// Returns the template text, or `None` when no template has that name.
    fn load(&self, name: &str) -> Result<Option<String>>;
}

/// Templates stored as files under one directory.
pub struct FsPromptStore {
    dir: PathBuf,
}

impl FsPromptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl PromptStore for FsPromptStore {
    fn load(&self, name: &str) -> Result<Option<String>> {
        let path = self.path_for(name);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read prompt {}", path.display())),
        }
    }
}

/// Configured template name, or [`DEFAULT_PROMPT_NAME`] when blank.
pub fn resolve_prompt_name(configured: Option<&str>) -> &str {
    match configured.map(str::trim) {
        Some(name) if !name.is_empty() => name,
        _ => DEFAULT_PROMPT_NAME,
    }
}

/// Load a system prompt with trailing whitespace removed.
///
/// Missing and whitespace-only templates yield [`FALLBACK_SYSTEM_PROMPT`].
/// Read errors other than not-found are logged and also fall back.
pub fn load_system_prompt(store: &dyn PromptStore, name: &str) -> String {
    match store.load(name) {
        Ok(Some(content)) => {
            let content = content.trim_end();
            if content.trim().is_empty() {
                tracing::warn!(template = name, "system prompt is empty; using fallback");
                FALLBACK_SYSTEM_PROMPT.to_string()
            } else {
                content.to_string()
            }
        }
        Ok(None) => {
            tracing::warn!(template = name, "system prompt not found; using fallback");
            FALLBACK_SYSTEM_PROMPT.to_string()
        }
        Err(e) => {
            tracing::error!(template = name, error = %e, "failed to load system prompt; using fallback");
            FALLBACK_SYSTEM_PROMPT.to_string()
        }
    }
}
