//! # doc-rag
//!
//! Retrieval-augmented question answering over a private document
//! collection.
//!
//! Raw files are chunked, embedded, and stored in a SQLite-backed vector
//! collection. A question is answered by retrieving the most relevant
//! chunks, filtering them by score, numbering them into a cited context
//! block, and asking a chat model to answer from that context only.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌────────────┐
//! │ data/raw  │──▶│ Chunk+Embed  │──▶│  SQLite    │
//! │ (admin)   │   │  (ingest)    │   │ collection │
//! └───────────┘   └──────────────┘   └─────┬──────┘
//!                                          │
//!                                   ┌──────▼──────┐
//!                                   │  Retrieval  │
//!                                   │   Engine    │
//!                                   └──────┬──────┘
//!                                   ┌──────▼──────┐   ┌──────────┐
//!                                   │ Orchestrator│──▶│ Chat LLM │
//!                                   └──────┬──────┘   └──────────┘
//!                              ┌───────────┴──────────┐
//!                              ▼                      ▼
//!                         ┌─────────┐           ┌──────────┐
//!                         │   CLI   │           │   HTTP   │
//!                         │(docrag) │           │  (axum)  │
//!                         └─────────┘           └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docrag init                          # create the vector store
//! docrag ingest handbook.txt           # file under [ingest].data_path
//! docrag ask "What is the eternal return?"
//! docrag serve                         # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Queries, chunks, chat turns, usage, citations |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | HTTP error contract |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index traits and stores |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`retriever`] | Scoring policy and index lifecycle |
//! | [`prompt`] | System-prompt templates |
//! | [`llm`] | Chat-completion client |
//! | [`orchestrator`] | Context assembly and answer generation |
//! | [`chunk`] | Text chunking |
//! | [`ingest`] | File ingestion |
//! | [`admin`] | Raw-file repository and index maintenance |
//! | [`server`] | HTTP API |

pub mod admin;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod retriever;
pub mod server;
