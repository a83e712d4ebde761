//! Embedding helpers
//!
//! Vectors are produced by external embedding services; this module only
//! stores, validates and compares them.

mod similarity;
mod vector;

pub use similarity::cosine_similarity;
pub use vector::{bytes_to_vec_f32, validate_vector, vec_f32_to_bytes, MAX_EMBEDDING_DIMENSIONS};
