//! Text embedding trait and implementations.
//!
//! - `OnnxTextEmbedder` loads a sentence-transformer ONNX model (e.g.
//!   all-MiniLM-L6-v2) via ort and tokenizes with the HuggingFace tokenizers
//!   crate. This is the production embedding backend.
//! - `HashingEmbedder` builds deterministic feature-hashed bag-of-words
//!   vectors. It needs no model files and is used offline and in tests.
//!
//! Every vector leaving this module is L2-normalized, so inner product
//! equals cosine similarity.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use marquee_core::error::MarqueeError;
use ort::session::Session;
use ort::value::TensorRef;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::info;

/// Tolerance used when checking that a vector has unit length.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;

/// Maximum tokens fed to the sentence-transformer per text.
const MAX_SEQUENCE_TOKENS: usize = 256;

/// L2-normalize in place. Returns the norm before normalization; a zero
/// vector is left untouched.
pub fn normalize(vector: &mut [f32]) -> f32 {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in vector.iter_mut() {
            *val /= norm;
        }
    }
    norm
}

/// Whether `vector` has L2 norm 1 within [`UNIT_NORM_TOLERANCE`].
pub fn is_unit_norm(vector: &[f32]) -> bool {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    (norm - 1.0).abs() <= UNIT_NORM_TOLERANCE
}

/// Service turning text into fixed-length unit vectors.
pub trait TextEmbedder: Send + Sync {
    /// Embed a single text.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, MarqueeError>> + Send;

    /// Embed several texts in one model call. Output order matches input.
    fn embed_batch(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, MarqueeError>> + Send;

    /// Dimensionality of produced vectors.
    fn dimensions(&self) -> usize;

    /// Identifier of the underlying model.
    fn model_id(&self) -> &str;
}

/// Object-safe version of [`TextEmbedder`] for dynamic dispatch.
///
/// `TextEmbedder` returns `impl Future` and is therefore not object-safe.
/// This trait boxes the futures so that `Arc<dyn DynTextEmbedder>` can be
/// shared between the indexing pipeline and the query engine. Every
/// `TextEmbedder` implements it through the blanket impl below.
pub trait DynTextEmbedder: Send + Sync {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>, MarqueeError>> + Send + 'a>>;

    fn embed_batch_boxed<'a>(
        &'a self,
        texts: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, MarqueeError>> + Send + 'a>>;

    fn dimensions(&self) -> usize;

    fn model_id(&self) -> &str;
}

impl<T: TextEmbedder> DynTextEmbedder for T {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>, MarqueeError>> + Send + 'a>> {
        Box::pin(self.embed(text))
    }

    fn embed_batch_boxed<'a>(
        &'a self,
        texts: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, MarqueeError>> + Send + 'a>> {
        Box::pin(self.embed_batch(texts))
    }

    fn dimensions(&self) -> usize {
        TextEmbedder::dimensions(self)
    }

    fn model_id(&self) -> &str {
        TextEmbedder::model_id(self)
    }
}

// ---------------------------------------------------------------------------
// OnnxTextEmbedder - real ONNX Runtime inference
// ---------------------------------------------------------------------------

/// ONNX Runtime-backed embedder using a sentence-transformer model.
///
/// Expects a model directory containing:
/// - `model.onnx`: the sentence-transformer ONNX export
/// - `tokenizer.json`: the HuggingFace fast-tokenizer file
///
/// The session is not re-entrant, so inference runs under a mutex. The lock
/// covers only the `run` call, never tokenization or pooling.
pub struct OnnxTextEmbedder {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
    dimensions: usize,
    model_id: String,
}

// ort::Session is Send + Sync internally (uses Arc<SharedSessionInner>).
unsafe impl Send for OnnxTextEmbedder {}
unsafe impl Sync for OnnxTextEmbedder {}

impl std::fmt::Debug for OnnxTextEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxTextEmbedder")
            .field("model_id", &self.model_id)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl Clone for OnnxTextEmbedder {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            tokenizer: Arc::clone(&self.tokenizer),
            dimensions: self.dimensions,
            model_id: self.model_id.clone(),
        }
    }
}

impl OnnxTextEmbedder {
    /// Load a sentence-transformer model from the given directory.
    ///
    /// Fails immediately if the model or tokenizer is missing.
    pub fn from_directory(model_dir: &Path, model_id: &str) -> Result<Self, MarqueeError> {
        Self::from_files(
            &model_dir.join("model.onnx"),
            &model_dir.join("tokenizer.json"),
            model_id,
        )
    }

    /// Load from explicit model and tokenizer file paths.
    pub fn from_files(
        model_path: &Path,
        tokenizer_path: &Path,
        model_id: &str,
    ) -> Result<Self, MarqueeError> {
        if !model_path.exists() {
            return Err(MarqueeError::Config(format!(
                "ONNX model not found at {}",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(MarqueeError::Config(format!(
                "Tokenizer not found at {}",
                tokenizer_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| MarqueeError::Config(format!("ONNX session builder: {}", e)))?
            .with_intra_threads(1)
            .map_err(|e| MarqueeError::Config(format!("ONNX set threads: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| MarqueeError::Config(format!("ONNX load model: {}", e)))?;

        // Sentence-transformer output is typically [batch, seq_len, hidden_dim].
        let dimensions = session
            .outputs()
            .first()
            .and_then(|out| out.dtype().tensor_shape())
            .and_then(|shape| shape.last().copied())
            .map(|d| if d > 0 { d as usize } else { 384 })
            .unwrap_or(384);

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| MarqueeError::Config(format!("Failed to load tokenizer: {}", e)))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_SEQUENCE_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| MarqueeError::Config(format!("Failed to set truncation: {}", e)))?;

        info!(
            model = %model_path.display(),
            model_id,
            dimensions,
            "Loaded ONNX text embedding model"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            dimensions,
            model_id: model_id.to_string(),
        })
    }

    /// Tokenize, run inference on the padded batch, and mean-pool each row.
    fn embed_batch_sync(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MarqueeError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| MarqueeError::Embedding(format!("Tokenization failed: {}", e)))?;

        let batch = encodings.len();
        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0)
            .max(1);

        let mut input_ids = vec![0i64; batch * seq_len];
        let mut attention_mask = vec![0i64; batch * seq_len];
        let mut token_type_ids = vec![0i64; batch * seq_len];
        for (row, encoding) in encodings.iter().enumerate() {
            let base = row * seq_len;
            for (col, &id) in encoding.get_ids().iter().enumerate() {
                input_ids[base + col] = id as i64;
            }
            for (col, &m) in encoding.get_attention_mask().iter().enumerate() {
                attention_mask[base + col] = m as i64;
            }
            for (col, &t) in encoding.get_type_ids().iter().enumerate() {
                token_type_ids[base + col] = t as i64;
            }
        }

        let ids_array = ndarray::Array2::from_shape_vec((batch, seq_len), input_ids)
            .map_err(|e| MarqueeError::Embedding(format!("input_ids array: {}", e)))?;
        let mask_array = ndarray::Array2::from_shape_vec((batch, seq_len), attention_mask.clone())
            .map_err(|e| MarqueeError::Embedding(format!("attention_mask array: {}", e)))?;
        let type_array = ndarray::Array2::from_shape_vec((batch, seq_len), token_type_ids)
            .map_err(|e| MarqueeError::Embedding(format!("token_type_ids array: {}", e)))?;

        let ids_ref = TensorRef::from_array_view(&ids_array)
            .map_err(|e| MarqueeError::Embedding(format!("TensorRef input_ids: {}", e)))?;
        let mask_ref = TensorRef::from_array_view(&mask_array)
            .map_err(|e| MarqueeError::Embedding(format!("TensorRef attention_mask: {}", e)))?;
        let type_ref = TensorRef::from_array_view(&type_array)
            .map_err(|e| MarqueeError::Embedding(format!("TensorRef token_type_ids: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| MarqueeError::Embedding(format!("Session lock poisoned: {}", e)))?;
        let outputs = session
            .run(ort::inputs![ids_ref, mask_ref, type_ref])
            .map_err(|e| MarqueeError::Embedding(format!("ONNX inference failed: {}", e)))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| MarqueeError::Embedding(format!("Extract embeddings: {}", e)))?;

        let shape_dims: Vec<i64> = shape.iter().copied().collect();
        let mut vectors = match shape_dims.as_slice() {
            // Already pooled: [batch, hidden_dim].
            [_, hidden] if *hidden > 0 => {
                let hidden = *hidden as usize;
                data.chunks_exact(hidden)
                    .take(batch)
                    .map(<[f32]>::to_vec)
                    .collect::<Vec<_>>()
            }
            // Token embeddings: [batch, seq_len, hidden_dim].
            [_, out_seq, hidden] if *hidden > 0 => {
                let out_seq = *out_seq as usize;
                let hidden = *hidden as usize;
                mean_pool(data, &attention_mask, batch, seq_len, out_seq, hidden)
            }
            other => {
                return Err(MarqueeError::Embedding(format!(
                    "Unexpected output shape: {:?}",
                    other
                )))
            }
        };
        drop(outputs);
        drop(session);

        for vector in &mut vectors {
            if normalize(vector) == 0.0 {
                return Err(MarqueeError::Embedding(
                    "Model produced a zero embedding".to_string(),
                ));
            }
        }
        Ok(vectors)
    }
}

/// Mean pooling over the sequence dimension, masked by the attention mask.
fn mean_pool(
    data: &[f32],
    attention_mask: &[i64],
    batch: usize,
    mask_seq: usize,
    out_seq: usize,
    hidden: usize,
) -> Vec<Vec<f32>> {
    let mut pooled = Vec::with_capacity(batch);
    for row in 0..batch {
        let mut acc = vec![0.0f32; hidden];
        let mut count = 0.0f32;
        for tok in 0..out_seq.min(mask_seq) {
            if attention_mask[row * mask_seq + tok] > 0 {
                let offset = (row * out_seq + tok) * hidden;
                for (dim, val) in acc.iter_mut().enumerate() {
                    *val += data[offset + dim];
                }
                count += 1.0;
            }
        }
        if count > 0.0 {
            for val in &mut acc {
                *val /= count;
            }
        }
        pooled.push(acc);
    }
    pooled
}

impl TextEmbedder for OnnxTextEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MarqueeError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| MarqueeError::Embedding("Model returned no embedding".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MarqueeError> {
        // ONNX Runtime inference is CPU-bound; run on a blocking thread.
        let svc = self.clone();
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || svc.embed_batch_sync(&texts))
            .await
            .map_err(|e| MarqueeError::Embedding(format!("Embedding task panicked: {}", e)))?
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ---------------------------------------------------------------------------
// HashingEmbedder - deterministic feature hashing
// ---------------------------------------------------------------------------

/// Feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed with blake3 into one bucket
/// with a ±1 sign. Texts sharing words therefore land close together, which
/// is enough for lexical retrieval without a model. Text without tokens maps
/// to the first basis vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub const MODEL_ID: &'static str = "feature-hashing";

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Embed synchronously. Always returns a unit vector.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for token in tokenize(text) {
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(raw) % self.dimensions as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        if normalize(&mut vector) == 0.0 {
            vector[0] = 1.0;
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

impl TextEmbedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MarqueeError> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MarqueeError> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        Self::MODEL_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0f32, 4.0];
        assert_eq!(normalize(&mut v), 5.0);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!(is_unit_norm(&v));

        let mut zero = vec![0.0f32; 4];
        assert_eq!(normalize(&mut zero), 0.0);
        assert!(!is_unit_norm(&zero));
    }

    #[tokio::test]
    async fn test_hashing_dimension_and_norm() {
        let embedder = HashingEmbedder::default();
        let v = embedder.embed("hello world").await.unwrap();
        assert_eq!(v.len(), 384);
        assert!(is_unit_norm(&v));
    }

    #[tokio::test]
    async fn test_hashing_deterministic() {
        let embedder = HashingEmbedder::default();
        let v1 = embedder.embed("same text").await.unwrap();
        let v2 = embedder.embed("same text").await.unwrap();
        assert_eq!(v1, v2);
    }

    #[tokio::test]
    async fn test_hashing_empty_text_is_unit() {
        let embedder = HashingEmbedder::new(16);
        let v = embedder.embed("").await.unwrap();
        assert!(is_unit_norm(&v));
        assert_eq!(v[0], 1.0);

        let punct = embedder.embed("?!  ...").await.unwrap();
        assert_eq!(v, punct);
    }

    #[tokio::test]
    async fn test_hashing_shared_words_are_closer() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed("space exploration").await.unwrap();
        let near = embedder
            .embed("A game about space exploration and trade")
            .await
            .unwrap();
        let far = embedder
            .embed("A romantic comedy set in Paris")
            .await
            .unwrap();
        assert!(dot(&query, &near) > dot(&query, &far));
    }

    #[tokio::test]
    async fn test_hashing_case_insensitive() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("Action Movie").await.unwrap();
        let b = embedder.embed("action movie").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_embed_batch_preserves_order() {
        let embedder = HashingEmbedder::default();
        let texts = vec!["first".to_string(), "second".to_string()];
        let batch = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], embedder.embed("first").await.unwrap());
        assert_eq!(batch[1], embedder.embed("second").await.unwrap());
    }

    #[tokio::test]
    async fn test_dyn_dispatch() {
        let embedder: Arc<dyn DynTextEmbedder> = Arc::new(HashingEmbedder::new(32));
        let v = embedder.embed_boxed("dyn").await.unwrap();
        assert_eq!(v.len(), 32);
        assert_eq!(embedder.dimensions(), 32);
        assert_eq!(embedder.model_id(), HashingEmbedder::MODEL_ID);
    }

    #[test]
    fn test_mean_pool_respects_mask() {
        // batch 1, seq 3, hidden 2; last token masked out.
        let data = [1.0, 2.0, 3.0, 4.0, 100.0, 100.0];
        let mask = [1, 1, 0];
        let pooled = mean_pool(&data, &mask, 1, 3, 3, 2);
        assert_eq!(pooled, vec![vec![2.0, 3.0]]);
    }

    #[test]
    fn test_onnx_missing_model_fails_fast() {
        let result = OnnxTextEmbedder::from_directory(Path::new("/nonexistent"), "minilm");
        assert!(matches!(result, Err(MarqueeError::Config(_))));
    }
}
