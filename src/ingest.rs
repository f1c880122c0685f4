//! File ingestion: raw file → chunks → embeddings → collection.
//!
//! Every chunk is stored with the same document-level metadata:
//!
//! | Key | Value |
//! |-----|-------|
//! | `file_name`, `source_file` | file name without directories |
//! | `source_path` | path as given to [`ingest_file`] |
//! | `file_ext` | lowercase extension with leading dot |
//! | `doc_id` | first 24 hex chars of SHA-256(path ‖ bytes) |
//! | `ingested_at` | Unix timestamp |
//! | `chunk_index` | position within the document |
//!
//! Re-ingesting a file appends a second copy; callers delete the old
//! chunks first when replacing a document.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::chunk::chunk_text;
use crate::config::IngestConfig;
use crate::index::sqlite::{NewEmbedding, SqliteCollection};
use crate::models::Metadata;

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub file_name: String,
    pub chunks: usize,
}

/// Lowercase extension with a leading dot, or `""`.
pub fn file_extension(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Stable document id: hash of the path and the file bytes.
pub fn stable_doc_id(path: &Path, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(bytes);
    let digest = format!("{:x}", hasher.finalize());
    digest[..24].to_string()
}

/// Chunk, embed, and store one file.
pub async fn ingest_file(
    config: &IngestConfig,
    batch_size: usize,
    collection: &SqliteCollection,
    path: &Path,
) -> Result<IngestReport> {
    let ext = file_extension(path);
    if !config.allows_extension(&ext) {
        bail!("Extension not allowed: {}", ext);
    }

    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let raw = std::str::from_utf8(&bytes)
        .with_context(|| format!("{} is not valid UTF-8 text", path.display()))?;
    let text = if ext == ".html" || ext == ".htm" {
        strip_html_tags(raw)
    } else {
        raw.to_string()
    };

    let chunks = chunk_text(&text, config.chunk_size, config.chunk_overlap);
    if chunks.is_empty() {
        bail!("No text content in {}", path.display());
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let doc_id = stable_doc_id(path, &bytes);
    let ingested_at = chrono::Utc::now().timestamp();

    tracing::info!(
        file = %path.display(),
        doc_id = %doc_id,
        chunks = chunks.len(),
        "ingesting file"
    );

    let mut items = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = collection.embedder().embed(&texts).await?;
        if vectors.len() != texts.len() {
            bail!(
                "Embedding provider returned {} vectors for {} chunks",
                vectors.len(),
                texts.len()
            );
        }

        for (chunk, vector) in batch.iter().zip(vectors) {
            let mut metadata = Metadata::new();
            metadata.insert("file_name".into(), file_name.clone().into());
            metadata.insert("source_file".into(), file_name.clone().into());
            metadata.insert("source_path".into(), path.display().to_string().into());
            metadata.insert("file_ext".into(), ext.clone().into());
            metadata.insert("doc_id".into(), doc_id.clone().into());
            metadata.insert("ingested_at".into(), ingested_at.into());
            metadata.insert("chunk_index".into(), chunk.index.into());
            items.push(NewEmbedding {
                text: chunk.text.clone(),
                metadata,
                vector,
            });
        }
    }

    let written = collection.insert(&items).await?;
    tracing::info!(file = %file_name, chunks = written, collection = collection.name(), "ingestion done");

    Ok(IngestReport {
        doc_id,
        file_name,
        chunks: written,
    })
}

/// Reduce HTML to its visible text. Script and style bodies are dropped;
/// block-level closing tags become paragraph breaks.
pub fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open..];
        let Some(close) = after.find('>') else {
            rest = "";
            break;
        };
        let tag = after[1..close].trim().to_ascii_lowercase();
        rest = &after[close + 1..];

        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();

        if !tag.starts_with('/') && (name == "script" || name == "style") {
            let end = format!("</{}", name);
            match rest.to_ascii_lowercase().find(&end) {
                Some(pos) => {
                    let tail = &rest[pos..];
                    rest = tail.find('>').map(|p| &tail[p + 1..]).unwrap_or("");
                }
                None => rest = "",
            }
            continue;
        }

        match name.as_str() {
            "p" | "div" | "br" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                out.push_str("\n\n")
            }
            _ => out.push(' '),
        }
    }
    out.push_str(rest);

    out.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
