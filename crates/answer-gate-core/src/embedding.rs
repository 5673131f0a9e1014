//! Vector utilities: normalization, similarity, and the on-disk matrix encoding.
//!
//! All vectors stored in a [`crate::VectorIndex`] are unit-normalized, so
//! similarity during search reduces to a plain [`dot`] product.
//!
//! # Matrix format
//!
//! ```text
//! offset  size        field
//! 0       4           magic  b"AGVM"
//! 4       4           format version (u32 LE, currently 1)
//! 8       4           rows   (u32 LE)
//! 12      4           dims   (u32 LE)
//! 16      rows*dims*4 row-major f32 LE values
//! ```

use crate::error::IndexError;

const MATRIX_MAGIC: &[u8; 4] = b"AGVM";
const MATRIX_VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

/// Scale `v` to unit length.
///
/// Returns `None` for empty vectors and vectors whose norm is zero or not
/// finite; such vectors have no direction and cannot be compared.
pub fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    if v.is_empty() {
        return None;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm < f32::EPSILON {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

/// Dot product of two equal-length slices. Extra elements of the longer
/// slice are ignored.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity between two arbitrary (not necessarily normalized) vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Encode floats as little-endian bytes, 4 bytes per value.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes. A trailing partial value is ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Serialize a row-major matrix of `rows × dims` values with a header.
pub fn encode_matrix(rows: usize, dims: usize, values: &[f32]) -> Result<Vec<u8>, IndexError> {
    if rows * dims != values.len() {
        return Err(IndexError::Corrupt(format!(
            "matrix has {} values, expected {} × {}",
            values.len(),
            rows,
            dims
        )));
    }
    let rows32 = u32::try_from(rows).map_err(|_| IndexError::Corrupt("too many rows".into()))?;
    let dims32 = u32::try_from(dims).map_err(|_| IndexError::Corrupt("too many dims".into()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + values.len() * 4);
    out.extend_from_slice(MATRIX_MAGIC);
    out.extend_from_slice(&MATRIX_VERSION.to_le_bytes());
    out.extend_from_slice(&rows32.to_le_bytes());
    out.extend_from_slice(&dims32.to_le_bytes());
    out.extend_from_slice(&vec_to_blob(values));
    Ok(out)
}

/// Parse bytes produced by [`encode_matrix`] into `(rows, dims, values)`.
pub fn decode_matrix(bytes: &[u8]) -> Result<(usize, usize, Vec<f32>), IndexError> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MATRIX_MAGIC {
        return Err(IndexError::Corrupt("missing matrix header".into()));
    }
    let read_u32 = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

    let version = read_u32(4);
    if version != MATRIX_VERSION {
        return Err(IndexError::Corrupt(format!(
            "unsupported matrix version {}",
            version
        )));
    }
    let rows = read_u32(8) as usize;
    let dims = read_u32(12) as usize;

    let body = &bytes[HEADER_LEN..];
    if body.len() != rows * dims * 4 {
        return Err(IndexError::Corrupt(format!(
            "matrix body is {} bytes, header declares {} × {}",
            body.len(),
            rows,
            dims
        )));
    }
    Ok((rows, dims, blob_to_vec(body)))
}
