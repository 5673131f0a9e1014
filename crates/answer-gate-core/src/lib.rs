//! # answer-gate core
//!
//! Pure, I/O-free building blocks shared by the `answer-gate` application:
//! the chunk data model, the character-budget chunker, vector math and
//! matrix encoding, and the exact brute-force [`index::VectorIndex`].
//!
//! This crate has no tokio, HTTP, or filesystem dependencies. Persistence,
//! backends, and request handling live in the application crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;

pub use error::IndexError;
pub use index::VectorIndex;
pub use models::{DocumentChunk, IndexEntry, SearchHit};
