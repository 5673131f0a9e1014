//! Character-budget text chunker.
//!
//! Splits extracted document text into [`DocumentChunk`]s of at most
//! `max_chars` bytes, keeping paragraphs together where they fit.
//!
//! # Algorithm
//!
//! 1. Split text on blank lines (`\n\n`) into paragraphs; drop empty ones.
//! 2. Pack consecutive paragraphs into a buffer while it stays within budget.
//! 3. A paragraph larger than the budget is cut on its own: at the last
//!    newline inside the window, else the last space, else a hard cut on a
//!    UTF-8 character boundary.
//! 4. Whitespace-only input produces no chunks.
//!
//! Every chunk gets a random UUID, a SHA-256 hash of its text, and
//! `total_chunks` in its metadata.
//!
//! ```rust
//! use answer_gate_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("recipes/margarita.txt", 0, "Tequila.\n\nLime juice.", 1500);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].source_key, "recipes/margarita.txt");
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::DocumentChunk;

/// Default chunk budget in bytes.
pub const DEFAULT_MAX_CHARS: usize = 1500;

/// Split `text` from source `source_key` into chunks with contiguous
/// indices starting at 0.
pub fn chunk_text(
    source_key: &str,
    last_modified: i64,
    text: &str,
    max_chars: usize,
) -> Vec<DocumentChunk> {
    let max_chars = max_chars.max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if para.len() > max_chars {
            flush(&mut buf, &mut pieces);
            pieces.extend(split_oversized(para, max_chars).into_iter().map(String::from));
            continue;
        }

        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if would_be > max_chars {
            flush(&mut buf, &mut pieces);
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }
    flush(&mut buf, &mut pieces);

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| make_chunk(source_key, last_modified, index, total, piece))
        .collect()
}

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn flush(buf: &mut String, pieces: &mut Vec<String>) {
    if !buf.is_empty() {
        pieces.push(std::mem::take(buf));
    }
}

fn split_oversized(text: &str, max_chars: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if rest.len() <= max_chars {
            let piece = rest.trim();
            if !piece.is_empty() {
                out.push(piece);
            }
            break;
        }

        let limit = snap_to_char_boundary(rest, max_chars);
        let window = &rest[..limit];
        let cut = match window.rfind('\n').or_else(|| window.rfind(' ')) {
            Some(pos) if pos > 0 => pos + 1,
            _ if limit > 0 => limit,
            // A single character wider than the budget.
            _ => rest.chars().next().map(char::len_utf8).unwrap_or(rest.len()),
        };

        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        rest = &rest[cut..];
    }
    out
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(
    source_key: &str,
    last_modified: i64,
    index: usize,
    total: usize,
    text: String,
) -> DocumentChunk {
    DocumentChunk {
        id: Uuid::new_v4().to_string(),
        source_key: source_key.to_string(),
        chunk_index: index,
        content_hash: sha256_hex(text.as_bytes()),
        text,
        last_modified,
        metadata: serde_json::json!({ "total_chunks": total }),
    }
}
