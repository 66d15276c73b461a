//! Sentence embedding model.
//!
//! Turns text into a unit vector:
//! - Tokenizes with the WordPiece tokenizer
//! - Runs an `InferenceEngine` to get per-token hidden states
//! - Mean-pools over real tokens and L2-normalizes the result

use std::path::{Path, PathBuf};

use crate::config::ModelConfig;
use crate::semantic::onnx::OnnxEngine;
use crate::semantic::tokenizer::{EncodedInput, Tokenizer, TokenizerError, Vocabulary};

/// File name of the ONNX model inside the model directory.
pub const MODEL_FILE: &str = "model.onnx";
/// File name of the WordPiece vocabulary inside the model directory.
pub const VOCAB_FILE: &str = "vocab.txt";

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Vocabulary not found: {}", .0.display())]
    VocabularyNotFound(PathBuf),

    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Model output has {got} values, expected {expected} (sequence length x dimensions)")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("Dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

impl EmbeddingError {
    /// Errors that indicate a model/vocabulary mismatch rather than a bad input.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EmbeddingError::ShapeMismatch { .. }
                | EmbeddingError::ModelNotFound(_)
                | EmbeddingError::VocabularyNotFound(_)
                | EmbeddingError::InitFailed(_)
        )
    }
}

/// Runtime that maps encoded input to per-token hidden states.
///
/// Implementations return the hidden states flattened row-major as
/// `sequence_length x dimensions` values.
pub trait InferenceEngine: Send + Sync {
    fn run(&self, input: &EncodedInput) -> Result<Vec<f32>, EmbeddingError>;
}

/// Tokenizer + inference engine + pooling.
pub struct EmbeddingModel {
    tokenizer: Tokenizer,
    engine: Box<dyn InferenceEngine>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Load the ONNX model and vocabulary described by `config`.
    ///
    /// Both files must exist; a missing one is a startup error.
    pub fn load(config: &ModelConfig, model_dir: &Path) -> Result<Self, EmbeddingError> {
        let model_path = model_dir.join(MODEL_FILE);
        let vocab_path = model_dir.join(VOCAB_FILE);

        if !model_path.is_file() {
            return Err(EmbeddingError::ModelNotFound(model_path));
        }
        if !vocab_path.is_file() {
            return Err(EmbeddingError::VocabularyNotFound(vocab_path));
        }

        let vocab = Vocabulary::load(&vocab_path)?;
        log::info!(
            "Loaded vocabulary with {} tokens from {}",
            vocab.len(),
            vocab_path.display()
        );
        let tokenizer = Tokenizer::new(vocab, config.max_sequence_length)?;

        let engine = OnnxEngine::load(&model_path, config.dimensions, config.intra_threads)?;
        log::info!("Loaded model '{}' from {}", config.name, model_path.display());

        Ok(Self::with_engine(
            tokenizer,
            Box::new(engine),
            &config.name,
            config.dimensions,
        ))
    }

    /// Assemble a model from an already-built tokenizer and engine.
    pub fn with_engine(
        tokenizer: Tokenizer,
        engine: Box<dyn InferenceEngine>,
        model_name: &str,
        dimensions: usize,
    ) -> Self {
        Self {
            tokenizer,
            engine,
            model_name: model_name.to_string(),
            dimensions,
        }
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_id(&self) -> String {
        model_id(&self.model_name)
    }

    /// Generate a unit-length embedding for `text`.
    ///
    /// Empty or whitespace-only text yields the zero vector without
    /// invoking the engine.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimensions]);
        }

        let input = self.tokenizer.encode(text);
        let hidden = self.engine.run(&input)?;
        let pooled = mean_pool(&hidden, &input.attention_mask, self.dimensions)?;

        Ok(normalize(pooled))
    }
}

/// SHA256 of the model name, hex encoded. Identifies cache compatibility.
pub fn model_id(model_name: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Average hidden states over positions whose mask is 1.
pub fn mean_pool(
    hidden: &[f32],
    attention_mask: &[i64],
    dimensions: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    let expected = attention_mask.len() * dimensions;
    if hidden.len() != expected {
        return Err(EmbeddingError::ShapeMismatch {
            expected,
            got: hidden.len(),
        });
    }

    let mut pooled = vec![0.0f32; dimensions];
    let mut count = 0usize;

    for (row, _) in hidden
        .chunks_exact(dimensions)
        .zip(attention_mask)
        .filter(|(_, mask)| **mask == 1)
    {
        for (acc, value) in pooled.iter_mut().zip(row) {
            *acc += value;
        }
        count += 1;
    }

    if count > 0 {
        for value in pooled.iter_mut() {
            *value /= count as f32;
        }
    }

    Ok(pooled)
}

/// Scale to unit length; the zero vector is returned unchanged.
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = l2_norm(&vector);
    if norm == 0.0 {
        return vector;
    }

    for value in vector.iter_mut() {
        *value /= norm;
    }
    vector
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity in [-1, 1]. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, EmbeddingError> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    Ok((dot / (norm_a * norm_b)).clamp(-1.0, 1.0))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};

    /// Deterministic engine: each real position emits a one-hot row at
    /// `token_id % dimensions`; padding rows are filled with noise so that
    /// pooling bugs show up.
    pub struct BagOfTokensEngine {
        pub dimensions: usize,
        pub calls: Arc<AtomicUsize>,
    }

    impl BagOfTokensEngine {
        pub fn new(dimensions: usize) -> Self {
            Self {
                dimensions,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl InferenceEngine for BagOfTokensEngine {
        fn run(&self, input: &EncodedInput) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut hidden = vec![0.0; input.len() * self.dimensions];
            for (pos, (&id, &mask)) in input
                .input_ids
                .iter()
                .zip(&input.attention_mask)
                .enumerate()
            {
                let row = &mut hidden[pos * self.dimensions..(pos + 1) * self.dimensions];
                if mask == 1 {
                    row[id as usize % self.dimensions] = 1.0;
                } else {
                    row.iter_mut().for_each(|v| *v = 7.5);
                }
            }
            Ok(hidden)
        }
    }

    /// Engine returning one row too few.
    struct TruncatedEngine(usize);

    impl InferenceEngine for TruncatedEngine {
        fn run(&self, input: &EncodedInput) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![0.5; (input.len() - 1) * self.0])
        }
    }

    /// Vocabulary in BERT layout with the given words appended after `[MASK]`.
    pub fn test_vocab(words: &[&str]) -> Vocabulary {
        let mut lines: Vec<String> = vec!["[PAD]".to_string()];
        lines.extend((1..100).map(|i| format!("[unused{i}]")));
        lines.extend(["[UNK]", "[CLS]", "[SEP]", "[MASK]"].map(String::from));
        lines.extend(words.iter().map(|w| w.to_string()));
        Vocabulary::from_lines(lines).unwrap()
    }

    /// Bag-of-tokens engine whose first call blocks until `Gate::open`.
    pub struct GatedEngine {
        inner: BagOfTokensEngine,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<Option<mpsc::Receiver<()>>>,
    }

    /// Test-side handle of a `GatedEngine`.
    pub struct Gate {
        entered: mpsc::Receiver<()>,
        release: mpsc::Sender<()>,
    }

    impl Gate {
        /// Block until the engine's first call is in flight.
        pub fn wait_entered(&self) {
            self.entered.recv().unwrap();
        }

        pub fn open(&self) {
            let _ = self.release.send(());
        }
    }

    impl InferenceEngine for GatedEngine {
        fn run(&self, input: &EncodedInput) -> Result<Vec<f32>, EmbeddingError> {
            let entered = self.entered.lock().unwrap().take();
            if let Some(entered) = entered {
                let _ = entered.send(());
                let release = self.release.lock().unwrap().take();
                if let Some(release) = release {
                    // also returns when the gate is dropped
                    let _ = release.recv();
                }
            }
            self.inner.run(input)
        }
    }

    pub fn gated_model(words: &[&str], dimensions: usize) -> (EmbeddingModel, Gate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let engine = GatedEngine {
            inner: BagOfTokensEngine::new(dimensions),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(Some(release_rx)),
        };
        let tokenizer = Tokenizer::new(test_vocab(words), 32).unwrap();
        let model = EmbeddingModel::with_engine(tokenizer, Box::new(engine), "test-model", dimensions);
        let gate = Gate {
            entered: entered_rx,
            release: release_tx,
        };
        (model, gate)
    }

    pub fn test_model(words: &[&str], dimensions: usize) -> (EmbeddingModel, Arc<AtomicUsize>) {
        let tokenizer = Tokenizer::new(test_vocab(words), 32).unwrap();
        let engine = BagOfTokensEngine::new(dimensions);
        let calls = engine.calls.clone();
        let model = EmbeddingModel::with_engine(tokenizer, Box::new(engine), "test-model", dimensions);
        (model, calls)
    }

    #[test]
    fn test_embedding_is_unit_length() {
        let (model, _) = test_model(&["dios", "es", "amor"], 384);

        for text in ["dios es amor", "amor", "something unknown entirely"] {
            let embedding = model.embed(text).unwrap();
            assert_eq!(embedding.len(), 384);
            assert!((l2_norm(&embedding) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_empty_text_is_zero_vector_without_inference() {
        let (model, calls) = test_model(&["dios"], 16);

        assert_eq!(model.embed("").unwrap(), vec![0.0; 16]);
        assert_eq!(model.embed("   ").unwrap(), vec![0.0; 16]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_padding_excluded_from_pooling() {
        let hidden = vec![
            1.0, 0.0, // real
            0.0, 1.0, // real
            9.0, 9.0, // padding
        ];
        let pooled = mean_pool(&hidden, &[1, 1, 0], 2).unwrap();
        assert_eq!(pooled, vec![0.5, 0.5]);
    }

    #[test]
    fn test_mean_pool_shape_mismatch() {
        let result = mean_pool(&[1.0, 2.0, 3.0], &[1, 1], 2);
        assert!(matches!(
            result,
            Err(EmbeddingError::ShapeMismatch { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn test_engine_shape_mismatch_is_fatal() {
        let tokenizer = Tokenizer::new(test_vocab(&["dios"]), 8).unwrap();
        let model = EmbeddingModel::with_engine(tokenizer, Box::new(TruncatedEngine(4)), "bad", 4);

        let err = model.embed("dios").unwrap_err();
        assert!(matches!(err, EmbeddingError::ShapeMismatch { expected: 32, got: 28 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_normalize_zero_vector_unchanged() {
        assert_eq!(normalize(vec![0.0, 0.0, 0.0]), vec![0.0, 0.0, 0.0]);
        assert_eq!(normalize(vec![3.0, 4.0]), vec![0.6, 0.8]);
    }

    #[test]
    fn test_similarity_bounds() {
        let v = normalize(vec![0.3, -1.2, 2.0, 0.5]);
        let neg: Vec<f32> = v.iter().map(|x| -x).collect();

        assert!((cosine_similarity(&v, &v).unwrap() - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&v, &neg).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_dimension_mismatch() {
        let result = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]);
        assert!(matches!(
            result,
            Err(EmbeddingError::DimensionMismatch { left: 2, right: 3 })
        ));
    }

    #[test]
    fn test_model_id_is_stable() {
        let (a, _) = test_model(&[], 8);
        let (b, _) = test_model(&["other"], 8);
        assert_eq!(a.model_id(), b.model_id());
        assert_eq!(a.model_id().len(), 64);
    }

    #[test]
    fn test_load_missing_model_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig::default();

        let result = EmbeddingModel::load(&config, dir.path());
        assert!(matches!(result, Err(EmbeddingError::ModelNotFound(_))));

        std::fs::write(dir.path().join(MODEL_FILE), b"not really onnx").unwrap();
        let result = EmbeddingModel::load(&config, dir.path());
        assert!(matches!(result, Err(EmbeddingError::VocabularyNotFound(_))));
    }

    #[test]
    #[ignore = "requires model files"]
    fn test_real_model_embedding() {
        let dir = std::env::var("VERSO_MODEL_DIR").unwrap();
        let model = EmbeddingModel::load(&ModelConfig::default(), Path::new(&dir)).unwrap();

        let embedding = model.embed("en el principio creó Dios los cielos y la tierra").unwrap();
        assert_eq!(embedding.len(), 384);
        assert!((l2_norm(&embedding) - 1.0).abs() < 0.01);
    }
}
