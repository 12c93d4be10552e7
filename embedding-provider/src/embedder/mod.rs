use thiserror::Error;

#[cfg(feature = "onnx")]
pub mod onnx;
#[cfg(feature = "onnx")]
pub use onnx::{OnnxConfig, OnnxEmbedder};

/// Literal prefixes the encoder prepends, matching the asymmetric
/// passage/query training convention.
pub const PASSAGE_PREFIX: &str = "passage: ";
pub const QUERY_PREFIX: &str = "query: ";

/// Identifies the backing implementation that powers an embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Hashed,
    Onnx,
}

/// Static metadata describing a particular embedder instance. `model_id` and
/// `dimension` are stamped into every stored embedding row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderInfo {
    pub provider: ProviderKind,
    pub model_id: String,
    pub dimension: usize,
}

/// Errors that can be produced by embedder operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmbedderError {
    #[error("invalid embedder configuration: {message}")]
    InvalidConfiguration { message: String },
    #[error("input text exceeds max length of {max_length} chars, actual length: {actual_length}")]
    InputTooLong { max_length: usize, actual_length: usize },
    #[error("provider failure: {message}")]
    ProviderFailure { message: String },
}

/// Core interface for all embedder implementations.
///
/// `encode_passages` and `encode_queries` differ only in the literal prefix
/// prepended before encoding; both return one unit-norm vector per input.
pub trait Embedder: Send + Sync {
    fn encode_passages(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError>;
    fn encode_queries(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError>;
    fn info(&self) -> &EmbedderInfo;
}

/// Configuration for the seeded hashed-feature embedder.
#[derive(Debug, Clone)]
pub struct HashedConfig {
    pub dimension: usize,
    pub seed: u64,
    pub max_input_length: usize,
    pub model_id: String,
}

/// Offline-deterministic embedder: tokens are hashed into `dimension`
/// buckets with a signed contribution, then the vector is L2-normalised.
/// Texts sharing tokens land in shared buckets, so cosine similarity tracks
/// lexical overlap.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    info: EmbedderInfo,
    seed: u64,
    max_input_length: usize,
}

impl HashedEmbedder {
    pub fn new(config: HashedConfig) -> Result<Self, EmbedderError> {
        if config.dimension == 0 {
            return Err(EmbedderError::InvalidConfiguration {
                message: "dimension must be greater than zero".into(),
            });
        }
        if config.max_input_length == 0 {
            return Err(EmbedderError::InvalidConfiguration {
                message: "max_input_length must be greater than zero".into(),
            });
        }
        Ok(Self {
            info: EmbedderInfo {
                provider: ProviderKind::Hashed,
                model_id: config.model_id,
                dimension: config.dimension,
            },
            seed: config.seed,
            max_input_length: config.max_input_length,
        })
    }

    fn encode_one(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let actual_length = text.chars().count();
        if actual_length > self.max_input_length {
            return Err(EmbedderError::InputTooLong {
                max_length: self.max_input_length,
                actual_length,
            });
        }

        let dim = self.info.dimension;
        let mut vector = vec![0f32; dim];
        for token in tokenize(text) {
            let h = fnv1a64(self.seed, token.as_bytes());
            let bucket = (h % dim as u64) as usize;
            // One hash bit decides the sign so collisions partially cancel.
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalise(&mut vector);
        Ok(vector)
    }

    fn encode_with_prefix(
        &self,
        prefix: &str,
        texts: &[&str],
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts
            .iter()
            .map(|t| self.encode_one(&format!("{prefix}{t}")))
            .collect()
    }
}

impl Embedder for HashedEmbedder {
    fn encode_passages(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        self.encode_with_prefix(PASSAGE_PREFIX, texts)
    }

    fn encode_queries(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        self.encode_with_prefix(QUERY_PREFIX, texts)
    }

    fn info(&self) -> &EmbedderInfo {
        &self.info
    }
}

/// Lowercased runs of alphanumeric chars. Punctuation never reaches a bucket.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// FNV-1a, seeded. Stable across platforms and releases, unlike the std
/// hasher.
fn fnv1a64(seed: u64, bytes: &[u8]) -> u64 {
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = 0xcbf2_9ce4_8422_2325u64 ^ seed;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// In-place L2 normalisation. A vector with no tokens gets a fixed basis
/// vector so the unit-norm invariant holds for every stored embedding.
pub(crate) fn l2_normalise(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v = ((*v as f64) / norm) as f32;
        }
    } else if let Some(first) = vector.first_mut() {
        *first = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_hashed_config;

    #[test]
    fn vectors_are_unit_norm() {
        let e = HashedEmbedder::new(default_hashed_config()).expect("valid config");
        let vecs = e.encode_passages(&["hybrid ranking mixes bm25 and vectors"]).unwrap();
        let norm: f32 = vecs[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() <= 1e-6, "norm was {norm}");
    }

    #[test]
    fn empty_text_still_normalises() {
        let e = HashedEmbedder::new(default_hashed_config()).expect("valid config");
        let vecs = e.encode_passages(&[""]).unwrap();
        let norm: f32 = vecs[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() <= 1e-6);
    }

    #[test]
    fn passage_and_query_prefixes_differ() {
        let e = HashedEmbedder::new(default_hashed_config()).expect("valid config");
        let p = e.encode_passages(&["same words"]).unwrap();
        let q = e.encode_queries(&["same words"]).unwrap();
        assert_ne!(p[0], q[0]);
    }

    #[test]
    fn shared_tokens_raise_cosine() {
        let e = HashedEmbedder::new(default_hashed_config()).expect("valid config");
        let passages = e
            .encode_passages(&["paragraph one about retrieval", "totally different subject matter"])
            .unwrap();
        let query = e.encode_queries(&["paragraph one"]).unwrap();
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&query[0], &passages[0]) > dot(&query[0], &passages[1]));
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let mut cfg = default_hashed_config();
        cfg.dimension = 0;
        let err = HashedEmbedder::new(cfg).unwrap_err();
        assert!(matches!(err, EmbedderError::InvalidConfiguration { .. }));
    }

    #[test]
    fn over_length_input_is_rejected() {
        let mut cfg = default_hashed_config();
        cfg.max_input_length = 8;
        let e = HashedEmbedder::new(cfg).expect("valid config");
        let err = e.encode_queries(&["far far far too long"]).unwrap_err();
        assert!(matches!(err, EmbedderError::InputTooLong { .. }));
    }
}
