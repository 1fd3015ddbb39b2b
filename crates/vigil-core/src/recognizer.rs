//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional identity embeddings from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: symmetric normalization
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Computes one identity embedding per face box.
pub trait FaceEmbed {
    /// Embeddings for `faces`, in the same order.
    fn embed_faces(
        &mut self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, RecognizerError>;
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract the embedding of a single face.
    ///
    /// Faces with landmarks are aligned to the ArcFace template first; faces
    /// without landmarks (or with degenerate ones) use a plain box crop.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let crop = face
            .landmarks
            .as_ref()
            .and_then(|lm| alignment::align_face(image, lm))
            .unwrap_or_else(|| alignment::crop_face(image, face));

        let input = Self::preprocess(&crop);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(Embedding {
            values: l2_normalize(raw)?,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }

    /// Convert a 112×112 RGB crop into a NCHW float tensor.
    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            let p = crop
                .get_pixel_checked(x as u32, y as u32)
                .map_or(0.0, |px| px[c] as f32);
            (p - ARCFACE_MEAN) / ARCFACE_STD
        })
    }
}

impl FaceEmbed for FaceRecognizer {
    fn embed_faces(
        &mut self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, RecognizerError> {
        faces.iter().map(|face| self.extract(image, face)).collect()
    }
}

/// Check the embedding dimension and scale it to unit length.
fn l2_normalize(raw: &[f32]) -> Result<Vec<f32>, RecognizerError> {
    if raw.len() != ARCFACE_EMBEDDING_DIM {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    Ok(if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([128, 128, 128]));
        let tensor = FaceRecognizer::preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        let crop = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([255, 0, 128]));
        let tensor = FaceRecognizer::preprocess(&crop);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let mut raw = vec![0.0f32; ARCFACE_EMBEDDING_DIM];
        raw[0] = 3.0;
        raw[1] = 4.0;
        let values = l2_normalize(&raw).unwrap();
        assert!((values[0] - 0.6).abs() < 1e-6);
        assert!((values[1] - 0.8).abs() < 1e-6);
        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_rejects_wrong_dimension() {
        let err = l2_normalize(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, RecognizerError::InferenceFailed(_)));
    }

    #[test]
    fn test_l2_normalize_zero_vector_passthrough() {
        let raw = vec![0.0f32; ARCFACE_EMBEDDING_DIM];
        assert_eq!(l2_normalize(&raw).unwrap(), raw);
    }
}
