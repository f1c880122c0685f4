//! Raw-file repository and index maintenance.
//!
//! [`DataRepo`] owns the directory of source documents (`[ingest].data_path`).
//! Every user-supplied relative path goes through [`DataRepo::resolve`],
//! which refuses anything that would land outside the repository root.
//!
//! [`AdminService`] combines the repository with the vector store and the
//! retrieval engine. Every mutation of the store ends with
//! [`RetrievalEngine::rebuild`]; a failed rebuild is logged and reported
//! but never undoes the mutation.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::index::sqlite::SqliteCollectionProvider;
use crate::ingest::{file_extension, ingest_file};
use crate::retriever::RetrievalEngine;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("extension not allowed: {0}")]
    ExtensionNotAllowed(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;

/// One entry of [`DataRepo::list`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RawFile {
    pub name: String,
    pub rel_path: String,
    pub ext: String,
    pub size_bytes: u64,
    pub modified_ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedFile {
    pub saved_as: String,
    pub size_bytes: u64,
}

/// Directory of raw documents.
#[derive(Debug, Clone)]
pub struct DataRepo {
    root: PathBuf,
    config: IngestConfig,
}

impl DataRepo {
    /// Open the repository, creating the root directory if needed.
    pub fn open(config: &IngestConfig) -> RepoResult<Self> {
        std::fs::create_dir_all(&config.data_path)?;
        let root = config.data_path.canonicalize()?;
        if !root.is_dir() {
            return Err(RepoError::InvalidPath(format!(
                "data_path is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self {
            root,
            config: config.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Map a relative path to an absolute path under the root.
    ///
    /// Rejects empty paths, `.`/`..`, any `..` segment, absolute paths, and
    /// paths whose existing prefix resolves (through symlinks) outside the
    /// root. The target itself need not exist.
    pub fn resolve(&self, rel_path: &str) -> RepoResult<PathBuf> {
        let cleaned = rel_path.trim().trim_start_matches('/').replace('\\', "/");
        if cleaned.split('/').all(|s| s.is_empty() || s == ".") {
            return Err(RepoError::InvalidPath(format!("'{}'", rel_path)));
        }
        if cleaned.split('/').any(|s| s == "..") {
            return Err(RepoError::InvalidPath(format!(
                "path traversal detected in '{}'",
                rel_path
            )));
        }
        if Path::new(&cleaned).is_absolute() {
            return Err(RepoError::InvalidPath(format!("'{}' is absolute", rel_path)));
        }

        let candidate = self.root.join(&cleaned);
        let mut existing = candidate.as_path();
        while !existing.exists() {
            existing = match existing.parent() {
                Some(parent) => parent,
                None => break,
            };
        }
        let resolved = existing.canonicalize()?;
        if !resolved.starts_with(&self.root) {
            return Err(RepoError::InvalidPath(format!(
                "'{}' is outside the data repository",
                rel_path
            )));
        }
        Ok(candidate)
    }

    /// Like [`resolve`](Self::resolve), but the target must be an existing file.
    pub fn resolve_file(&self, rel_path: &str) -> RepoResult<PathBuf> {
        let path = self.resolve(rel_path)?;
        if !path.is_file() {
            return Err(RepoError::NotFound(rel_path.to_string()));
        }
        Ok(path)
    }

    /// Path relative to the root, with `/` separators.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Files in the repository, newest first. `ext` filters by extension,
    /// with or without the leading dot.
    pub fn list(&self, recursive: bool, ext: Option<&str>) -> RepoResult<Vec<RawFile>> {
        let ext_filter = ext
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .map(|e| if e.starts_with('.') { e } else { format!(".{}", e) });

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable entry while listing raw files");
                    None
                }
            })
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let file_ext = file_extension(path);
            if let Some(wanted) = &ext_filter {
                if &file_ext != wanted {
                    continue;
                }
            }

            let meta = entry.metadata().map_err(std::io::Error::from)?;
            let modified_ts = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            files.push(RawFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                rel_path: self.relative(path),
                ext: file_ext,
                size_bytes: meta.len(),
                modified_ts,
            });
        }

        files.sort_by(|a, b| {
            b.modified_ts
                .cmp(&a.modified_ts)
                .then_with(|| a.rel_path.cmp(&b.rel_path))
        });
        Ok(files)
    }

    /// Write an upload into the repository, replacing any file of that name.
    pub fn save(&self, file_name: &str, bytes: &[u8]) -> RepoResult<SavedFile> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(RepoError::InvalidPath("missing filename".to_string()));
        }
        let ext = file_extension(Path::new(file_name));
        if !self.config.allows_extension(&ext) {
            return Err(RepoError::ExtensionNotAllowed(ext));
        }

        let target = self.resolve(file_name)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, bytes)?;
        tracing::info!(file = %target.display(), size = bytes.len(), "upload saved");

        Ok(SavedFile {
            saved_as: self.relative(&target),
            size_bytes: bytes.len() as u64,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub ingested: String,
    pub doc_id: String,
    pub chunks: usize,
    pub collection: String,
    pub rebuilt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub saved_as: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub deleted_file: String,
    pub deleted_embeddings: u64,
    pub collection: String,
    pub rebuilt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorDeleteOutcome {
    pub file_name: String,
    pub deleted: u64,
    pub collection_count: i64,
    pub rebuilt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetOutcome {
    pub collection: String,
    pub deleted: u64,
    pub rebuilt: bool,
}

/// Repository + vector store + retrieval engine, as used by the admin
/// routes and the CLI.
pub struct AdminService {
    repo: DataRepo,
    store: Arc<SqliteCollectionProvider>,
    retriever: Arc<RetrievalEngine>,
    batch_size: usize,
}

impl AdminService {
    pub fn new(
        repo: DataRepo,
        store: Arc<SqliteCollectionProvider>,
        retriever: Arc<RetrievalEngine>,
        batch_size: usize,
    ) -> Self {
        Self {
            repo,
            store,
            retriever,
            batch_size,
        }
    }

    pub fn repo(&self) -> &DataRepo {
        &self.repo
    }

    pub fn collection_name(&self) -> &str {
        self.store.collection_name()
    }

    /// Chunk, embed, and index a file already in the repository.
    pub async fn ingest(&self, rel_path: &str) -> RepoResult<IngestOutcome> {
        let target = self.repo.resolve_file(rel_path)?;
        let ext = file_extension(&target);
        if !self.repo.config().allows_extension(&ext) {
            return Err(RepoError::ExtensionNotAllowed(ext));
        }

        let collection = self.store.open_collection().await?;
        let report = ingest_file(self.repo.config(), self.batch_size, &collection, &target).await?;
        let rebuilt = self.refresh_retriever().await;

        Ok(IngestOutcome {
            ingested: self.repo.relative(&target),
            doc_id: report.doc_id,
            chunks: report.chunks,
            collection: collection.name().to_string(),
            rebuilt,
        })
    }

    /// Save an upload, then ingest it. A failed ingestion removes the file
    /// again so the repository and the index stay in step.
    pub async fn upload_and_ingest(&self, file_name: &str, bytes: &[u8]) -> RepoResult<UploadOutcome> {
        let saved = self.repo.save(file_name, bytes)?;
        match self.ingest(&saved.saved_as).await {
            Ok(outcome) => Ok(UploadOutcome {
                saved_as: saved.saved_as,
                size_bytes: saved.size_bytes,
                chunks: Some(outcome.chunks),
            }),
            Err(e) => {
                tracing::error!(file = %saved.saved_as, error = %e, "ingestion failed; removing upload");
                if let Ok(path) = self.repo.resolve(&saved.saved_as) {
                    if let Err(rm) = std::fs::remove_file(&path) {
                        tracing::warn!(file = %path.display(), error = %rm, "failed to roll back upload");
                    }
                }
                Err(e)
            }
        }
    }

    /// Delete a raw file and every chunk ingested from it, then rebuild the
    /// retriever's index handle.
    pub async fn delete_document(&self, rel_path: &str) -> RepoResult<DeleteOutcome> {
        let target = self.repo.resolve_file(rel_path)?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        std::fs::remove_file(&target)?;
        tracing::warn!(file = %rel_path, "raw file deleted");

        let collection = self.store.open_collection().await?;
        let deleted_embeddings = collection.delete_by_file_name(&file_name).await?;
        tracing::info!(
            file = %file_name,
            chunks = deleted_embeddings,
            collection = collection.name(),
            "embeddings deleted"
        );

        let rebuilt = self.refresh_retriever().await;
        Ok(DeleteOutcome {
            deleted_file: rel_path.to_string(),
            deleted_embeddings,
            collection: collection.name().to_string(),
            rebuilt,
        })
    }

    /// Delete the chunks of a file but keep the file itself.
    pub async fn delete_vectors(&self, rel_path: &str) -> RepoResult<VectorDeleteOutcome> {
        let target = self.repo.resolve_file(rel_path)?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let collection = self.store.open_collection().await?;
        let deleted = collection.delete_by_file_name(&file_name).await?;
        let collection_count = collection.count().await?;
        tracing::info!(file = %file_name, deleted, "embeddings deleted");

        let rebuilt = self.refresh_retriever().await;
        Ok(VectorDeleteOutcome {
            file_name,
            deleted,
            collection_count,
            rebuilt,
        })
    }

    /// Empty the collection. Raw files are left alone.
    pub async fn reset_collection(&self) -> RepoResult<ResetOutcome> {
        let collection = self.store.open_collection().await?;
        let deleted = collection.clear().await?;
        tracing::warn!(collection = collection.name(), deleted, "collection reset");

        let rebuilt = self.refresh_retriever().await;
        Ok(ResetOutcome {
            collection: collection.name().to_string(),
            deleted,
            rebuilt,
        })
    }

    /// Rebuild the retriever's handle explicitly.
    pub async fn rebuild(&self) -> anyhow::Result<()> {
        self.retriever.rebuild().await
    }

    async fn refresh_retriever(&self) -> bool {
        match self.retriever.rebuild().await {
            Ok(()) => {
                tracing::info!("retriever rebuilt");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to rebuild retriever");
                false
            }
        }
    }
}
