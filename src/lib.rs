//! # answer-gate
//!
//! Retrieval-augmented question answering behind rate limiting and
//! two-sided moderation, with an incrementally maintained vector index.
//!
//! ## Architecture
//!
//! ```text
//!   request path                                   maintenance path
//!   ────────────                                   ────────────────
//!   RateLimiter                                    DocumentSource (fs / S3)
//!       │                                                │
//!   ModerationGate (input)                         TextExtractor ─► chunk ─► Embedder
//!       │                                                │
//!   Retriever ◄──── IndexHandle (Arc snapshot) ◄── IndexUpdater ─► IndexStore (disk)
//!       │
//!   GenerationOrchestrator ─► Generator
//!       │
//!   ModerationGate (output)
//!       │
//!   AuditSink
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! agate --config ./config/agate.toml rebuild
//! agate --config ./config/agate.toml ask --identity u42 "margarita recipe"
//! agate --config ./config/agate.toml update
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`backend`] | `Embedder` / `Generator` traits, timeouts, HTTP retry |
//! | [`embedding`] | Embedding clients (OpenAI, Ollama, Yandex, local) |
//! | [`generation`] | Text generation clients (OpenAI, Ollama, Yandex) |
//! | [`response`] | Pulling answer text out of raw backend JSON |
//! | [`sources`] | Document source trait and filesystem source |
//! | [`source_s3`] | S3 document source |
//! | [`extract`] | Plain-text extraction by file type |
//! | [`cache`] | Single-value TTL cache |
//! | [`index_store`] | Index persistence and the shared snapshot handle |
//! | [`updater`] | Incremental and full index updates |
//! | [`jobs`] | Observable, cancellable background update jobs |
//! | [`rate_limit`] | Per-identity sliding window with cooldown |
//! | [`moderation`] | Pattern and model-based content moderation |
//! | [`retriever`] | Query embedding and index search |
//! | [`orchestrator`] | Prompting with rotation and fallbacks |
//! | [`audit`] | Append-only audit records |
//! | [`pipeline`] | The full request lifecycle |
//! | [`cancel`] | Cooperative cancellation flag |

pub mod audit;
pub mod backend;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod index_store;
pub mod jobs;
pub mod logging;
pub mod moderation;
pub mod orchestrator;
pub mod pipeline;
pub mod rate_limit;
pub mod response;
pub mod retriever;
pub mod source_s3;
pub mod sources;
pub mod updater;

pub use answer_gate_core::{DocumentChunk, IndexEntry, IndexError, SearchHit, VectorIndex};
