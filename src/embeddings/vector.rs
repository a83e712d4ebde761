//! Embedding vector encoding and validation
//!
//! Vectors are persisted as little-endian `f32` BLOBs, 4 bytes per component.

use zerocopy::AsBytes;

use crate::error::{Result, StoreError};

/// Upper bound on accepted vector length
pub const MAX_EMBEDDING_DIMENSIONS: usize = 8192;

/// Convert f32 vector to bytes for SQLite blob
pub fn vec_f32_to_bytes(vec: &[f32]) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        vec.as_bytes().to_vec()
    } else {
        vec.iter().flat_map(|&f| f.to_le_bytes()).collect()
    }
}

/// Convert a SQLite blob back into an f32 vector
pub fn bytes_to_vec_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Serialization(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Reject vectors that cannot be compared meaningfully
///
/// Empty vectors, vectors above [`MAX_EMBEDDING_DIMENSIONS`] and vectors with
/// NaN or infinite components are malformed.
pub fn validate_vector(vec: &[f32]) -> Result<()> {
    if vec.is_empty() {
        return Err(StoreError::invalid("embedding vector is empty"));
    }
    if vec.len() > MAX_EMBEDDING_DIMENSIONS {
        return Err(StoreError::invalid(format!(
            "embedding has {} dimensions, maximum is {}",
            vec.len(),
            MAX_EMBEDDING_DIMENSIONS
        )));
    }
    if let Some(pos) = vec.iter().position(|v| !v.is_finite()) {
        return Err(StoreError::invalid(format!(
            "embedding component {} is not finite",
            pos
        )));
    }
    Ok(())
}
