//! ONNX Runtime inference engine.

use std::path::Path;
use std::sync::Mutex;

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

use crate::semantic::embeddings::{EmbeddingError, InferenceEngine};
use crate::semantic::tokenizer::EncodedInput;

/// Runs a BERT-style ONNX export (`input_ids`, `attention_mask`,
/// `token_type_ids` in, `last_hidden_state` out).
///
/// Uses a Mutex because `Session::run` requires `&mut self`.
pub struct OnnxEngine {
    session: Mutex<Session>,
    dimensions: usize,
}

impl OnnxEngine {
    pub fn load(path: &Path, dimensions: usize, intra_threads: usize) -> Result<Self, EmbeddingError> {
        let session = Session::builder()
            .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|builder| builder.with_intra_threads(intra_threads))
            .and_then(|builder| builder.commit_from_file(path))
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        Ok(Self {
            session: Mutex::new(session),
            dimensions,
        })
    }

    fn tensor(values: &[i64]) -> Result<Tensor<i64>, EmbeddingError> {
        Tensor::from_array(([1usize, values.len()], values.to_vec()))
            .map_err(|e| EmbeddingError::InferenceFailed(e.to_string()))
    }
}

impl InferenceEngine for OnnxEngine {
    fn run(&self, input: &EncodedInput) -> Result<Vec<f32>, EmbeddingError> {
        let input_ids = Self::tensor(&input.input_ids)?;
        let attention_mask = Self::tensor(&input.attention_mask)?;
        let token_type_ids = Self::tensor(&input.token_type_ids)?;

        let mut session = self.session.lock().map_err(|e| {
            EmbeddingError::InferenceFailed(format!("Failed to acquire session lock: {}", e))
        })?;

        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ])
            .map_err(|e| EmbeddingError::InferenceFailed(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError::InferenceFailed(e.to_string()))?;

        // [batch, sequence, hidden]
        let expected = input.len() * self.dimensions;
        let shape_ok = shape.len() == 3
            && shape[0] == 1
            && shape[1] as usize == input.len()
            && shape[2] as usize == self.dimensions;
        if !shape_ok || data.len() != expected {
            return Err(EmbeddingError::ShapeMismatch {
                expected,
                got: data.len(),
            });
        }

        Ok(data.to_vec())
    }
}
