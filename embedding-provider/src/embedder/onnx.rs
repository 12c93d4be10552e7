//! ONNX Runtime backend, behind the `onnx` feature.
//!
//! Runs a sentence-embedding model through a shared-library ONNX Runtime:
//! tokenize, run, mean-pool over the attention mask, L2-normalise. Output is
//! deterministic for identical `(model, text)` inputs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use ndarray::Array2;
use ort::{session::Session, value::Tensor, Error as OrtError};
use tokenizers::{Encoding, Tokenizer};

use super::{
    l2_normalise, Embedder, EmbedderError, EmbedderInfo, ProviderKind, PASSAGE_PREFIX,
    QUERY_PREFIX,
};

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub runtime_library_path: PathBuf,
    pub dimension: usize,
    pub max_input_tokens: usize,
    pub model_id: String,
}

pub struct OnnxEmbedder {
    info: EmbedderInfo,
    session: Mutex<Session>,
    tokenizer: Arc<Tokenizer>,
    pad_id: i64,
    max_input_tokens: usize,
}

static ORT_RUNTIME_PATH: OnceLock<PathBuf> = OnceLock::new();

impl OnnxEmbedder {
    pub fn new(config: OnnxConfig) -> Result<Self, EmbedderError> {
        if config.dimension == 0 {
            return Err(EmbedderError::InvalidConfiguration {
                message: "dimension must be greater than zero".into(),
            });
        }
        if config.max_input_tokens == 0 {
            return Err(EmbedderError::InvalidConfiguration {
                message: "max_input_tokens must be greater than zero".into(),
            });
        }

        let runtime = resolve_existing_path(&config.runtime_library_path, "ONNX Runtime library")?;
        ensure_ort_initialized(&runtime)?;

        let model_path = resolve_existing_path(&config.model_path, "ONNX model")?;
        let tokenizer_path = resolve_existing_path(&config.tokenizer_path, "tokenizer config")?;

        let session = Session::builder()
            .map_err(|err| map_ort_error("create session builder", err))?
            .commit_from_file(&model_path)
            .map_err(|err| map_ort_error("load ONNX model", err))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|err| {
            EmbedderError::ProviderFailure { message: format!("load tokenizer failed: {err}") }
        })?;
        let pad_id = tokenizer
            .token_to_id("<pad>")
            .or_else(|| tokenizer.token_to_id("[PAD]"))
            .ok_or_else(|| EmbedderError::InvalidConfiguration {
                message: format!(
                    "tokenizer `{}` declares no pad token",
                    tokenizer_path.display()
                ),
            })? as i64;

        Ok(Self {
            info: EmbedderInfo {
                provider: ProviderKind::Onnx,
                model_id: config.model_id,
                dimension: config.dimension,
            },
            session: Mutex::new(session),
            tokenizer: Arc::new(tokenizer),
            pad_id,
            max_input_tokens: config.max_input_tokens,
        })
    }

    fn encode_with_prefix(
        &self,
        prefix: &str,
        texts: &[&str],
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let prefixed: Vec<String> = texts.iter().map(|t| format!("{prefix}{t}")).collect();
        let encodings = self.prepare_encodings(&prefixed)?;
        let (input_ids, attention_mask, attention_rows) = self.build_input_tensors(&encodings)?;
        let (data, batch, seq_len, hidden) = self.run_session(input_ids, attention_mask)?;

        if batch != attention_rows.len() {
            return Err(EmbedderError::ProviderFailure {
                message: format!(
                    "model returned batch size {batch}, prepared {}",
                    attention_rows.len()
                ),
            });
        }
        let mut out = mean_pool(&data, &attention_rows, seq_len, hidden);
        for v in &mut out {
            if v.len() != self.info.dimension {
                return Err(EmbedderError::ProviderFailure {
                    message: format!(
                        "pooled dimension {} does not match configured {}",
                        v.len(),
                        self.info.dimension
                    ),
                });
            }
            l2_normalise(v);
        }
        Ok(out)
    }

    fn prepare_encodings(&self, texts: &[String]) -> Result<Vec<Encoding>, EmbedderError> {
        let encodings = texts
            .iter()
            .map(|t| self.tokenizer.encode(t.as_str(), true))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| EmbedderError::ProviderFailure {
                message: format!("tokenize inputs failed: {err}"),
            })?;
        let max_len = encodings.iter().map(Encoding::len).max().unwrap_or(0);
        if max_len > self.max_input_tokens {
            return Err(EmbedderError::InputTooLong {
                max_length: self.max_input_tokens,
                actual_length: max_len,
            });
        }
        Ok(encodings)
    }

    #[allow(clippy::type_complexity)]
    fn build_input_tensors(
        &self,
        encodings: &[Encoding],
    ) -> Result<(Tensor<i64>, Tensor<i64>, Vec<Vec<i64>>), EmbedderError> {
        let batch = encodings.len();
        let seq_len = encodings.iter().map(Encoding::len).max().unwrap_or(0);

        let mut input_ids = Array2::<i64>::zeros((batch, seq_len));
        let mut attention_mask = Array2::<i64>::zeros((batch, seq_len));
        let mut attention_rows = Vec::with_capacity(batch);

        for (row, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            for (col, (&id, &m)) in ids.iter().zip(mask.iter()).enumerate() {
                input_ids[(row, col)] = id as i64;
                attention_mask[(row, col)] = m as i64;
            }
            for col in ids.len()..seq_len {
                input_ids[(row, col)] = self.pad_id;
                attention_mask[(row, col)] = 0;
            }
            attention_rows
                .push((0..seq_len).map(|i| attention_mask[(row, i)]).collect::<Vec<i64>>());
        }

        let input_ids =
            Tensor::from_array(input_ids).map_err(|err| map_ort_error("prepare input_ids", err))?;
        let attention_mask = Tensor::from_array(attention_mask)
            .map_err(|err| map_ort_error("prepare attention_mask", err))?;
        Ok((input_ids, attention_mask, attention_rows))
    }

    fn run_session(
        &self,
        input_ids: Tensor<i64>,
        attention_mask: Tensor<i64>,
    ) -> Result<(Vec<f32>, usize, usize, usize), EmbedderError> {
        let mut session = self.session.lock().unwrap();
        let outputs = session
            .run(ort::inputs![input_ids, attention_mask])
            .map_err(|err| map_ort_error("execute ONNX session", err))?;
        let output = &outputs[0];
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|err| map_ort_error("extract output tensor", err))?;
        if shape.len() != 3 {
            return Err(EmbedderError::ProviderFailure {
                message: format!(
                    "model output must be rank-3 [batch, seq_len, hidden], got {:?}",
                    shape
                ),
            });
        }
        let batch: usize = shape[0].try_into().unwrap_or(0);
        let seq_len: usize = shape[1].try_into().unwrap_or(0);
        let hidden: usize = shape[2].try_into().unwrap_or(0);
        Ok((data.to_vec(), batch, seq_len, hidden))
    }
}

impl Embedder for OnnxEmbedder {
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

fn mean_pool(data: &[f32], attention_rows: &[Vec<i64>], seq_len: usize, hidden: usize) -> Vec<Vec<f32>> {
    let mut results = Vec::with_capacity(attention_rows.len());
    for (b, row) in attention_rows.iter().enumerate() {
        let mut sum = vec![0f32; hidden];
        let mut count = 0f32;
        for (t, &m) in row.iter().enumerate().take(seq_len) {
            if m == 1 {
                let base = (b * seq_len + t) * hidden;
                for (h, s) in sum.iter_mut().enumerate() {
                    *s += data[base + h];
                }
                count += 1.0;
            }
        }
        if count > 0.0 {
            for s in sum.iter_mut() {
                *s /= count;
            }
        }
        results.push(sum);
    }
    results
}

fn ensure_ort_initialized(runtime_library_path: &Path) -> Result<(), EmbedderError> {
    if let Some(existing) = ORT_RUNTIME_PATH.get() {
        if existing != runtime_library_path {
            return Err(EmbedderError::InvalidConfiguration {
                message: format!(
                    "ONNX Runtime already initialized with `{}`; cannot switch to `{}`",
                    existing.display(),
                    runtime_library_path.display()
                ),
            });
        }
        return Ok(());
    }
    let _ = ORT_RUNTIME_PATH.set(runtime_library_path.to_path_buf());
    ort::init_from(runtime_library_path.to_string_lossy().to_string())
        .with_name("context-cache")
        .commit()
        .map_err(|err| map_ort_error("initialize ONNX Runtime environment", err))?;
    Ok(())
}

fn resolve_existing_path(path: &Path, description: &str) -> Result<PathBuf, EmbedderError> {
    fs::metadata(path).map_err(|_| EmbedderError::InvalidConfiguration {
        message: format!("{description} `{}` does not exist", path.display()),
    })?;
    path.canonicalize().map_err(|err| EmbedderError::ProviderFailure {
        message: format!("failed to canonicalize {description} `{}`: {err}", path.display()),
    })
}

fn map_ort_error(context: &str, err: OrtError) -> EmbedderError {
    EmbedderError::ProviderFailure { message: format!("{context} failed: {err}") }
}
