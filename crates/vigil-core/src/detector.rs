//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.

use crate::letterbox::Letterbox;
use crate::nms;
use crate::types::BoundingBox;
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in an RGB raster.
pub trait FaceDetect {
    /// Detected faces, sorted by confidence (highest first).
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Output tensor indices for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideSlots {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw model outputs for one stride level.
struct StrideOutputs<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    slots: [StrideSlots; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let slots = map_output_slots(&output_names);
        tracing::debug!(?slots, "SCRFD output tensor mapping");

        Ok(Self { session, slots })
    }

    fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let (w, h) = image.dimensions();
        let letterbox = Letterbox::fit(w, h, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE);
        // Mid-grey padding normalises to ~0.0.
        let canvas = letterbox.apply(image, Rgb([128, 128, 128]));

        let size = SCRFD_INPUT_SIZE as usize;
        let tensor = Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            let p = canvas.get_pixel(x as u32, y as u32)[c] as f32;
            (p - SCRFD_MEAN) / SCRFD_STD
        });
        (tensor, letterbox)
    }
}

impl FaceDetect for FaceDetector {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in self.slots.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let level = StrideOutputs {
                stride,
                scores: extract(slot.score, "scores")?,
                bboxes: extract(slot.bbox, "bboxes")?,
                kps: extract(slot.kps, "kps")?,
            };
            candidates.extend(decode_level(&level, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let keep = nms::suppress(&candidates, SCRFD_NMS_THRESHOLD);
        let (w, h) = image.dimensions();
        let faces: Vec<BoundingBox> = keep
            .into_iter()
            .map(|i| candidates[i].clamp_to(w, h))
            .filter(|b| b.area() > 0.0)
            .collect();

        tracing::debug!(count = faces.len(), "SCRFD detections");
        Ok(faces)
    }
}

/// Resolve which output tensor holds which stride's score/bbox/kps.
///
/// Exports either name the tensors (`score_8`, `bbox_16`, `kps_32`, ...) or use
/// opaque numeric names, in which case the standard order is assumed:
/// `[0-2]` scores, `[3-5]` bboxes, `[6-8]` kps, each for strides 8/16/32.
fn map_output_slots(names: &[String]) -> [StrideSlots; 3] {
    let position = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideSlots>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideSlots {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(slots) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [slots[0], slots[1], slots[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideSlots {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Decode the anchors of one stride level whose score exceeds `threshold`.
fn decode_level(
    level: &StrideOutputs<'_>,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let stride = level.stride;
    let grid_w = letterbox.canvas_width as usize / stride;
    let grid_h = letterbox.canvas_height as usize / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors.min(level.scores.len()))
        .filter(|&idx| level.scores[idx] > threshold)
        .filter_map(|idx| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let anchor_x = (cell % grid_w) as f32 * step;
            let anchor_y = (cell / grid_w) as f32 * step;

            let d = level.bboxes.get(idx * 4..idx * 4 + 4)?;
            let (left, top) = letterbox.unmap(anchor_x - d[0] * step, anchor_y - d[1] * step);
            let (right, bottom) = letterbox.unmap(anchor_x + d[2] * step, anchor_y + d[3] * step);

            let mut face = BoundingBox::from_corners(left, top, right, bottom, level.scores[idx]);
            face.landmarks = level.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|p| {
                    letterbox.unmap(anchor_x + k[p * 2] * step, anchor_y + k[p * 2 + 1] * step)
                })
            });
            Some(face)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_output_slots_named() {
        let slots = map_output_slots(&names(&[
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16",
            "kps_32",
        ]));
        assert_eq!(slots[0], StrideSlots { score: 0, bbox: 3, kps: 6 });
        assert_eq!(slots[2], StrideSlots { score: 2, bbox: 5, kps: 8 });
    }

    #[test]
    fn test_output_slots_shuffled_names() {
        let slots = map_output_slots(&names(&[
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]));
        assert_eq!(slots[0], StrideSlots { score: 2, bbox: 0, kps: 1 });
        assert_eq!(slots[1], StrideSlots { score: 5, bbox: 3, kps: 4 });
        assert_eq!(slots[2], StrideSlots { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_output_slots_positional_fallback() {
        let generic: Vec<String> = (0..9).map(|i: usize| (448 + i).to_string()).collect();
        let slots = map_output_slots(&generic);
        assert_eq!(slots[1], StrideSlots { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_level_single_anchor() {
        // 64x64 canvas, stride 32 -> 2x2 grid, 8 anchors.
        let letterbox = Letterbox::fit(64, 64, 64, 64);
        let mut scores = vec![0.0f32; 8];
        // Anchor 3 -> cell 1 -> grid (x=1, y=0) -> anchor centre (32, 0).
        scores[3] = 0.9;
        let mut bboxes = vec![0.0f32; 8 * 4];
        bboxes[12..16].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);
        let kps = vec![0.0f32; 8 * 10];

        let level = StrideOutputs {
            stride: 32,
            scores: &scores,
            bboxes: &bboxes,
            kps: &kps,
        };
        let faces = decode_level(&level, &letterbox, 0.5);
        assert_eq!(faces.len(), 1);
        let (l, t, r, b) = faces[0].corners();
        assert!((l - 16.0).abs() < 1e-4);
        assert!((t - 0.0).abs() < 1e-4);
        assert!((r - 48.0).abs() < 1e-4);
        assert!((b - 32.0).abs() < 1e-4);
        assert_eq!(faces[0].landmarks.map(|l| l[0]), Some((32.0, 0.0)));
    }

    #[test]
    fn test_decode_level_threshold() {
        let letterbox = Letterbox::fit(64, 64, 64, 64);
        let scores = vec![0.5f32; 8];
        let bboxes = vec![1.0f32; 8 * 4];
        let level = StrideOutputs {
            stride: 32,
            scores: &scores,
            bboxes: &bboxes,
            kps: &[],
        };
        // Score must be strictly above the threshold.
        assert!(decode_level(&level, &letterbox, 0.5).is_empty());
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        let image = RgbImage::from_pixel(320, 160, Rgb([255, 0, 0]));
        let (tensor, letterbox) = FaceDetector::preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(letterbox.pad_y, 160.0);
        // Padding row is mid-grey, content row carries the red channel.
        assert!(tensor[[0, 0, 0, 0]].abs() < 0.01);
        assert!((tensor[[0, 0, 320, 320]] - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-3);
    }
}
