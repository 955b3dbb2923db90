//! Visual embeddings for posters and uploaded images.
//!
//! The primary path runs a vision encoder (`VisionModel`, ONNX in
//! production). When no model is loaded, or the model fails on an image,
//! a deterministic basic-feature descriptor is used instead: per-channel
//! color histograms plus grayscale statistics, zero-padded to the same
//! dimension and L2-normalized. `None` is returned only when the image
//! itself cannot be fetched or decoded.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::imageops::FilterType;
use image::DynamicImage;
use lru::LruCache;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use marquee_core::config::VisualConfig;
use marquee_core::error::MarqueeError;

use crate::embedding::normalize;

/// Identifier reported when only basic features are available.
pub const BASIC_FEATURES_ID: &str = "basic-features";

/// CLIP image normalization constants.
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_55, 0.261_302_6, 0.275_777_1];

/// Number of grayscale statistics appended after the histograms.
const GRAY_STATS: usize = 4;

/// An image to embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// `http(s)://` URL or local file path (optionally `file://`).
    Url(String),
    /// Raw encoded image bytes (PNG, JPEG, WebP).
    Bytes(Vec<u8>),
}

impl ImageRef {
    /// Memoization key. Byte inputs are keyed by content digest.
    pub fn cache_key(&self) -> String {
        match self {
            ImageRef::Url(url) => format!("url:{}", url.trim()),
            ImageRef::Bytes(bytes) => format!("bytes:{}", blake3::hash(bytes).to_hex()),
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            ImageRef::Url(url) => url.clone(),
            ImageRef::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }
}

impl From<&str> for ImageRef {
    fn from(url: &str) -> Self {
        ImageRef::Url(url.to_string())
    }
}

impl From<Vec<u8>> for ImageRef {
    fn from(bytes: Vec<u8>) -> Self {
        ImageRef::Bytes(bytes)
    }
}

/// Which path produced a visual embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualMethod {
    Model,
    BasicFeatures,
}

/// A unit-normalized visual embedding and the path that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualEmbedding {
    pub vector: Vec<f32>,
    pub method: VisualMethod,
}

/// A vision encoder. Inference is synchronous and CPU-bound; callers run it
/// on a blocking thread.
pub trait VisionModel: Send + Sync {
    /// Embed a decoded image. The result need not be normalized.
    fn embed_image(&self, image: &DynamicImage) -> Result<Vec<f32>, MarqueeError>;

    fn dimensions(&self) -> usize;

    fn model_id(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OnnxVisionModel
// ---------------------------------------------------------------------------

/// CLIP-style image encoder exported to ONNX.
///
/// Expects `model.onnx` taking a `[1, 3, H, W]` float tensor and producing
/// `[1, dim]` image embeddings.
pub struct OnnxVisionModel {
    session: Mutex<Session>,
    input_size: u32,
    dimensions: usize,
    model_id: String,
}

// ort::Session is Send + Sync internally (uses Arc<SharedSessionInner>).
unsafe impl Send for OnnxVisionModel {}
unsafe impl Sync for OnnxVisionModel {}

impl std::fmt::Debug for OnnxVisionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxVisionModel")
            .field("model_id", &self.model_id)
            .field("input_size", &self.input_size)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl OnnxVisionModel {
    /// Load `model.onnx` from `model_dir`.
    pub fn from_directory(
        model_dir: &Path,
        model_id: &str,
        input_size: u32,
        dimensions: usize,
    ) -> Result<Self, MarqueeError> {
        let model_path = model_dir.join("model.onnx");
        if !model_path.exists() {
            return Err(MarqueeError::Config(format!(
                "Vision model not found at {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| MarqueeError::Config(format!("ONNX session builder: {}", e)))?
            .with_intra_threads(1)
            .map_err(|e| MarqueeError::Config(format!("ONNX set threads: {}", e)))?
            .commit_from_file(&model_path)
            .map_err(|e| MarqueeError::Config(format!("ONNX load model: {}", e)))?;

        let dimensions = session
            .outputs()
            .first()
            .and_then(|out| out.dtype().tensor_shape())
            .and_then(|shape| shape.last().copied())
            .filter(|d| *d > 0)
            .map(|d| d as usize)
            .unwrap_or(dimensions);

        info!(
            model = %model_path.display(),
            model_id,
            dimensions,
            "Loaded ONNX vision model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size,
            dimensions,
            model_id: model_id.to_string(),
        })
    }

    /// Resize, convert to RGB, apply CLIP normalization, lay out as NCHW.
    fn preprocess(&self, image: &DynamicImage) -> Result<ndarray::Array4<f32>, MarqueeError> {
        let size = self.input_size;
        let rgb = image
            .resize_exact(size, size, FilterType::CatmullRom)
            .to_rgb8();
        let side = size as usize;
        let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel.0[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (value - CLIP_MEAN[c]) / CLIP_STD[c];
            }
        }
        Ok(tensor)
    }
}

impl VisionModel for OnnxVisionModel {
    fn embed_image(&self, image: &DynamicImage) -> Result<Vec<f32>, MarqueeError> {
        let tensor = self.preprocess(image)?;
        let input = TensorRef::from_array_view(&tensor)
            .map_err(|e| MarqueeError::Embedding(format!("TensorRef pixel_values: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| MarqueeError::Embedding(format!("Session lock poisoned: {}", e)))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| MarqueeError::Embedding(format!("ONNX inference failed: {}", e)))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| MarqueeError::Embedding(format!("Extract image embedding: {}", e)))?;

        if data.len() < self.dimensions {
            return Err(MarqueeError::Embedding(format!(
                "Vision model returned {} values, expected {}",
                data.len(),
                self.dimensions
            )));
        }
        Ok(data[..self.dimensions].to_vec())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ---------------------------------------------------------------------------
// Basic features
// ---------------------------------------------------------------------------

/// Deterministic low-level image descriptor.
///
/// Layout: `bins` red, `bins` green, `bins` blue histogram buckets (each
/// channel sums to 1), then grayscale mean, std, min, max in `[0, 1]`,
/// then zeros up to `dimensions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicFeatures {
    pub canonical_size: u32,
    pub bins: usize,
    pub dimensions: usize,
}

impl BasicFeatures {
    pub fn compute(&self, image: &DynamicImage) -> Vec<f32> {
        let size = self.canonical_size.max(1);
        let rgb = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();
        let pixel_count = (size as f32) * (size as f32);
        let bins = self.bins.max(1);

        let mut features = Vec::with_capacity(self.dimensions.max(bins * 3 + GRAY_STATS));
        for channel in 0..3 {
            let mut histogram = vec![0.0f32; bins];
            for pixel in rgb.pixels() {
                let bucket = pixel.0[channel] as usize * bins / 256;
                histogram[bucket] += 1.0;
            }
            features.extend(histogram.into_iter().map(|count| count / pixel_count));
        }

        let gray = image::imageops::grayscale(&rgb);
        let values: Vec<f32> = gray.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        features.extend([mean, variance.sqrt(), min, max]);

        features.resize(self.dimensions, 0.0);
        normalize(&mut features);
        features
    }
}

// ---------------------------------------------------------------------------
// VisualEmbedder
// ---------------------------------------------------------------------------

/// Embeds images with the vision model when possible and basic features
/// otherwise. Results are memoized per image reference in a bounded LRU.
pub struct VisualEmbedder {
    model: Option<Arc<dyn VisionModel>>,
    basic: BasicFeatures,
    http: reqwest::Client,
    cache: Mutex<LruCache<String, VisualEmbedding>>,
    dimensions: usize,
}

impl std::fmt::Debug for VisualEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisualEmbedder")
            .field("model_id", &self.model_id())
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl VisualEmbedder {
    /// Build the embedder. `model` is `None` when the vision model could not
    /// be loaded; basic features are then used for every image.
    pub fn new(
        model: Option<Arc<dyn VisionModel>>,
        config: &VisualConfig,
    ) -> Result<Self, MarqueeError> {
        let dimensions = model
            .as_ref()
            .map(|m| m.dimensions())
            .unwrap_or(config.dimensions);

        if config.histogram_bins * 3 + GRAY_STATS > dimensions {
            return Err(MarqueeError::Config(format!(
                "Visual dimension {} cannot hold {} histogram bins per channel",
                dimensions, config.histogram_bins
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .connect_timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|e| MarqueeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);

        if model.is_none() {
            warn!("No vision model loaded; visual embeddings use basic features");
        }

        Ok(Self {
            model,
            basic: BasicFeatures {
                canonical_size: config.canonical_size,
                bins: config.histogram_bins,
                dimensions,
            },
            http,
            cache: Mutex::new(LruCache::new(capacity)),
            dimensions,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Identifier of the primary model, or [`BASIC_FEATURES_ID`].
    pub fn model_id(&self) -> &str {
        self.model
            .as_ref()
            .map(|m| m.model_id())
            .unwrap_or(BASIC_FEATURES_ID)
    }

    /// True when no vision model is loaded.
    pub fn uses_basic_features_only(&self) -> bool {
        self.model.is_none()
    }

    /// Embed an image. `None` means no visual signal: the image could not be
    /// fetched or decoded.
    pub async fn embed(&self, image: &ImageRef) -> Option<Vec<f32>> {
        self.embed_detailed(image).await.map(|e| e.vector)
    }

    /// Like [`VisualEmbedder::embed`] but also reports which path was used.
    pub async fn embed_detailed(&self, image: &ImageRef) -> Option<VisualEmbedding> {
        let key = image.cache_key();
        if let Some(hit) = self.cache_get(&key) {
            debug!(image = %image.describe(), "Visual embedding cache hit");
            return Some(hit);
        }

        let bytes = match self.load_bytes(image).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(image = %image.describe(), error = %e, "Image could not be fetched");
                return None;
            }
        };

        let model = self.model.clone();
        let basic = self.basic;
        let dimensions = self.dimensions;
        let described = image.describe();
        let result = tokio::task::spawn_blocking(move || {
            compute_embedding(&bytes, model.as_deref(), basic, dimensions, &described)
        })
        .await;

        let embedding = match result {
            Ok(Ok(embedding)) => embedding,
            Ok(Err(e)) => {
                warn!(image = %image.describe(), error = %e, "Image could not be decoded");
                return None;
            }
            Err(e) => {
                warn!(image = %image.describe(), error = %e, "Visual embedding task panicked");
                return None;
            }
        };

        self.cache_put(key, embedding.clone());
        Some(embedding)
    }

    async fn load_bytes(&self, image: &ImageRef) -> Result<Vec<u8>, MarqueeError> {
        match image {
            ImageRef::Bytes(bytes) => Ok(bytes.clone()),
            ImageRef::Url(url) => {
                let url = url.trim();
                if url.starts_with("http://") || url.starts_with("https://") {
                    let response = self
                        .http
                        .get(url)
                        .send()
                        .await
                        .and_then(|r| r.error_for_status())
                        .map_err(|e| MarqueeError::NoVisualSignal(e.to_string()))?;
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| MarqueeError::NoVisualSignal(e.to_string()))?;
                    Ok(bytes.to_vec())
                } else {
                    let path = url.strip_prefix("file://").unwrap_or(url);
                    Ok(tokio::fs::read(path).await?)
                }
            }
        }
    }

    fn cache_get(&self, key: &str) -> Option<VisualEmbedding> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn cache_put(&self, key: String, embedding: VisualEmbedding) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, embedding);
        }
    }
}

/// Decode and embed. Errors only when decoding fails.
fn compute_embedding(
    bytes: &[u8],
    model: Option<&dyn VisionModel>,
    basic: BasicFeatures,
    dimensions: usize,
    described: &str,
) -> Result<VisualEmbedding, MarqueeError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| MarqueeError::NoVisualSignal(format!("decode failed: {}", e)))?;

    if let Some(model) = model {
        match model.embed_image(&image) {
            Ok(mut vector) if vector.len() == dimensions => {
                if normalize(&mut vector) > 0.0 {
                    return Ok(VisualEmbedding {
                        vector,
                        method: VisualMethod::Model,
                    });
                }
                warn!(
                    image = %described,
                    "Vision model returned a zero vector, falling back to basic features"
                );
            }
            Ok(vector) => {
                warn!(
                    image = %described,
                    len = vector.len(),
                    "Vision model output unusable, falling back to basic features"
                );
            }
            Err(e) => {
                warn!(
                    image = %described,
                    error = %e,
                    "Vision model failed, falling back to basic features"
                );
            }
        }
    }

    Ok(VisualEmbedding {
        vector: basic.compute(&image),
        method: VisualMethod::BasicFeatures,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embedding::is_unit_norm;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Encode a solid or gradient image as PNG bytes.
    pub(crate) fn png_bytes(width: u32, height: u32, seed: u8) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                seed.wrapping_add(x as u8),
                seed.wrapping_mul(3).wrapping_add(y as u8),
                seed,
            ])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    struct FailingModel;

    impl VisionModel for FailingModel {
        fn embed_image(&self, _image: &DynamicImage) -> Result<Vec<f32>, MarqueeError> {
            Err(MarqueeError::Embedding("GPU on fire".to_string()))
        }
        fn dimensions(&self) -> usize {
            512
        }
        fn model_id(&self) -> &str {
            "failing"
        }
    }

    struct CountingModel {
        calls: AtomicUsize,
    }

    impl VisionModel for CountingModel {
        fn embed_image(&self, image: &DynamicImage) -> Result<Vec<f32>, MarqueeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut v = vec![0.0f32; 512];
            v[0] = image.width() as f32;
            v[1] = image.height() as f32;
            Ok(v)
        }
        fn dimensions(&self) -> usize {
            512
        }
        fn model_id(&self) -> &str {
            "counting"
        }
    }

    struct ZeroModel;

    impl VisionModel for ZeroModel {
        fn embed_image(&self, _image: &DynamicImage) -> Result<Vec<f32>, MarqueeError> {
            Ok(vec![0.0; 512])
        }
        fn dimensions(&self) -> usize {
            512
        }
        fn model_id(&self) -> &str {
            "zero"
        }
    }

    fn config() -> VisualConfig {
        VisualConfig {
            fetch_timeout_secs: 2,
            canonical_size: 32,
            ..VisualConfig::default()
        }
    }

    #[test]
    fn test_basic_features_layout() {
        let basic = BasicFeatures {
            canonical_size: 16,
            bins: 8,
            dimensions: 64,
        };
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([255, 0, 128])));
        let v = basic.compute(&img);
        assert_eq!(v.len(), 64);
        assert!(is_unit_norm(&v));
        // Tail beyond histograms and stats is zero padding.
        assert!(v[8 * 3 + GRAY_STATS..].iter().all(|x| *x == 0.0));
        // Solid red channel lands in the last bucket.
        assert!(v[7] > 0.0);
        assert_eq!(v[0], 0.0);
    }

    #[test]
    fn test_basic_features_deterministic() {
        let basic = BasicFeatures {
            canonical_size: 32,
            bins: 32,
            dimensions: 512,
        };
        let img = image::load_from_memory(&png_bytes(40, 30, 7)).unwrap();
        assert_eq!(basic.compute(&img), basic.compute(&img));
    }

    #[tokio::test]
    async fn test_no_model_uses_basic_features() {
        let embedder = VisualEmbedder::new(None, &config()).unwrap();
        assert!(embedder.uses_basic_features_only());
        assert_eq!(embedder.model_id(), BASIC_FEATURES_ID);

        let e = embedder
            .embed_detailed(&ImageRef::Bytes(png_bytes(20, 20, 1)))
            .await
            .unwrap();
        assert_eq!(e.method, VisualMethod::BasicFeatures);
        assert_eq!(e.vector.len(), 512);
        assert!(is_unit_norm(&e.vector));
    }

    #[tokio::test]
    async fn test_failing_model_falls_back() {
        let embedder = VisualEmbedder::new(Some(Arc::new(FailingModel)), &config()).unwrap();
        let e = embedder
            .embed_detailed(&ImageRef::Bytes(png_bytes(20, 20, 2)))
            .await
            .unwrap();
        assert_eq!(e.method, VisualMethod::BasicFeatures);
        assert!(is_unit_norm(&e.vector));
    }

    #[tokio::test]
    async fn test_model_output_is_normalized() {
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let embedder = VisualEmbedder::new(Some(model), &config()).unwrap();
        let e = embedder
            .embed_detailed(&ImageRef::Bytes(png_bytes(3, 4, 0)))
            .await
            .unwrap();
        assert_eq!(e.method, VisualMethod::Model);
        assert!(is_unit_norm(&e.vector));
        // [3, 4, 0, ...] normalizes to [0.6, 0.8, 0, ...].
        assert!((e.vector[0] - 0.6).abs() < 1e-6);
        assert!((e.vector[1] - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_zero_model_output_falls_back() {
        let embedder = VisualEmbedder::new(Some(Arc::new(ZeroModel)), &config()).unwrap();
        let e = embedder
            .embed_detailed(&ImageRef::Bytes(png_bytes(12, 12, 5)))
            .await
            .unwrap();
        assert_eq!(e.method, VisualMethod::BasicFeatures);
        assert!(is_unit_norm(&e.vector));
    }

    #[tokio::test]
    async fn test_cache_memoizes_identical_refs() {
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let embedder = VisualEmbedder::new(Some(model.clone()), &config()).unwrap();
        let image = ImageRef::Bytes(png_bytes(8, 8, 9));

        let a = embedder.embed(&image).await.unwrap();
        let b = embedder.embed(&image).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_corrupt_bytes_is_none() {
        let embedder = VisualEmbedder::new(None, &config()).unwrap();
        let result = embedder
            .embed(&ImageRef::Bytes(b"definitely not an image".to_vec()))
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_url_is_none() {
        let embedder = VisualEmbedder::new(None, &config()).unwrap();
        let result = embedder
            .embed(&ImageRef::from("http://127.0.0.1:9/poster.jpg"))
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_local_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poster.png");
        std::fs::write(&path, png_bytes(16, 16, 4)).unwrap();

        let embedder = VisualEmbedder::new(None, &config()).unwrap();
        let from_path = embedder
            .embed(&ImageRef::Url(path.display().to_string()))
            .await;
        assert!(from_path.is_some());

        let missing = embedder
            .embed(&ImageRef::Url(dir.path().join("nope.png").display().to_string()))
            .await;
        assert!(missing.is_none());
    }

    #[test]
    fn test_cache_key() {
        let a = ImageRef::Bytes(vec![1, 2, 3]);
        let b = ImageRef::Bytes(vec![1, 2, 3]);
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(ImageRef::from(" http://x/y.jpg ").cache_key(), "url:http://x/y.jpg");
    }

    #[test]
    fn test_rejects_dimension_too_small() {
        let cfg = VisualConfig {
            dimensions: 16,
            ..config()
        };
        assert!(matches!(
            VisualEmbedder::new(None, &cfg),
            Err(MarqueeError::Config(_))
        ));
    }
}
