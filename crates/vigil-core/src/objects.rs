//! YOLO-style object detector for X-ray baggage scans.
//!
//! Expects a single-output YOLOv8 export shaped `[1, 4 + C, N]` (or its
//! transpose `[1, N, 4 + C]`), where each anchor carries a centre-format box
//! followed by one score per class.

use crate::letterbox::Letterbox;
use crate::nms;
use crate::types::{BoundingBox, ObjectDetection};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const YOLO_PAD_VALUE: u8 = 114;

#[derive(Error, Debug)]
pub enum ObjectDetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to read class labels from {path}: {source}")]
    Labels {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected output shape {0:?}")]
    UnexpectedShape(Vec<usize>),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds labelled objects in an RGB raster.
pub trait ObjectDetect {
    /// Detections ordered by score (highest first).
    fn detect_objects(
        &mut self,
        image: &RgbImage,
    ) -> Result<Vec<ObjectDetection>, ObjectDetectorError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoloParams {
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 100,
        }
    }
}

/// ONNX-backed YOLO detector.
pub struct ObjectDetector {
    session: Session,
    labels: Vec<String>,
    params: YoloParams,
}

impl ObjectDetector {
    /// Load the model and, if given, a newline-separated class labels file.
    pub fn load(
        model_path: &Path,
        labels_path: Option<&Path>,
        params: YoloParams,
    ) -> Result<Self, ObjectDetectorError> {
        if !model_path.exists() {
            return Err(ObjectDetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let labels = match labels_path {
            Some(path) => read_labels(path)?,
            None => Vec::new(),
        };

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            classes = labels.len(),
            input_size = params.input_size,
            "loaded object detection model"
        );

        Ok(Self {
            session,
            labels,
            params,
        })
    }

    fn preprocess(&self, image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let (w, h) = image.dimensions();
        let size = self.params.input_size;
        let letterbox = Letterbox::fit(w, h, size, size);
        let canvas = letterbox.apply(image, Rgb([YOLO_PAD_VALUE; 3]));

        let n = size as usize;
        let tensor = Array4::from_shape_fn((1, 3, n, n), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        (tensor, letterbox)
    }
}

impl ObjectDetect for ObjectDetector {
    fn detect_objects(
        &mut self,
        image: &RgbImage,
    ) -> Result<Vec<ObjectDetection>, ObjectDetectorError> {
        let (input, letterbox) = self.preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ObjectDetectorError::InferenceFailed(format!("detections: {e}")))?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

        let (w, h) = image.dimensions();
        let detections =
            decode_output(data, &dims, &self.params, &letterbox, &self.labels, (w, h))?;
        tracing::debug!(count = detections.len(), "object detections");
        Ok(detections)
    }
}

fn read_labels(path: &Path) -> Result<Vec<String>, ObjectDetectorError> {
    let text = std::fs::read_to_string(path).map_err(|source| ObjectDetectorError::Labels {
        path: path.display().to_string(),
        source,
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn class_name(labels: &[String], class_id: usize) -> String {
    labels
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("class{class_id}"))
}

/// Turn the raw YOLO tensor into source-space detections.
fn decode_output(
    data: &[f32],
    dims: &[usize],
    params: &YoloParams,
    letterbox: &Letterbox,
    labels: &[String],
    (img_w, img_h): (u32, u32),
) -> Result<Vec<ObjectDetection>, ObjectDetectorError> {
    let &[1, a, b] = dims else {
        return Err(ObjectDetectorError::UnexpectedShape(dims.to_vec()));
    };
    // Channel-major `[1, 4 + C, N]` is the default export; anchors outnumber channels.
    let (channels, anchors, channel_major) = if a <= b { (a, b, true) } else { (b, a, false) };
    if channels < 5 || data.len() < channels * anchors {
        return Err(ObjectDetectorError::UnexpectedShape(dims.to_vec()));
    }
    let value = |c: usize, i: usize| {
        if channel_major {
            data[c * anchors + i]
        } else {
            data[i * channels + c]
        }
    };

    let mut candidates: Vec<(usize, BoundingBox)> = Vec::new();
    for i in 0..anchors {
        let (class_id, score) = (4..channels)
            .map(|c| (c - 4, value(c, i)))
            .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score <= params.conf_threshold {
            continue;
        }

        let (cx, cy, bw, bh) = (value(0, i), value(1, i), value(2, i), value(3, i));
        let (left, top) = letterbox.unmap(cx - bw / 2.0, cy - bh / 2.0);
        let (right, bottom) = letterbox.unmap(cx + bw / 2.0, cy + bh / 2.0);
        let bbox =
            BoundingBox::from_corners(left, top, right, bottom, score).clamp_to(img_w, img_h);
        if bbox.area() > 0.0 {
            candidates.push((class_id, bbox));
        }
    }

    // Class-aware suppression: boxes only suppress boxes of the same class.
    let mut kept: Vec<ObjectDetection> = Vec::new();
    let mut classes: Vec<usize> = candidates.iter().map(|(c, _)| *c).collect();
    classes.sort_unstable();
    classes.dedup();
    for class_id in classes {
        let boxes: Vec<BoundingBox> = candidates
            .iter()
            .filter(|(c, _)| *c == class_id)
            .map(|(_, b)| b.clone())
            .collect();
        for idx in nms::suppress(&boxes, params.iou_threshold) {
            kept.push(ObjectDetection {
                label: class_name(labels, class_id),
                class_id,
                score: boxes[idx].confidence,
                bbox: boxes[idx].clone(),
            });
        }
    }

    kept.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    kept.truncate(params.max_detections);
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a channel-major `[1, 4 + C, N]` tensor from per-anchor rows.
    fn channel_major(rows: &[Vec<f32>]) -> (Vec<f32>, Vec<usize>) {
        let channels = rows[0].len();
        let anchors = rows.len();
        let mut data = vec![0.0; channels * anchors];
        for (i, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                data[c * anchors + i] = *v;
            }
        }
        (data, vec![1, channels, anchors])
    }

    fn identity_letterbox() -> Letterbox {
        Letterbox::fit(640, 640, 640, 640)
    }

    fn labels() -> Vec<String> {
        vec!["knife".into(), "gun".into()]
    }

    /// Decode a 640x640 frame with no letterbox padding.
    fn decode(
        data: &[f32],
        dims: &[usize],
        params: &YoloParams,
    ) -> Result<Vec<ObjectDetection>, ObjectDetectorError> {
        decode_output(data, dims, params, &identity_letterbox(), &labels(), (640, 640))
    }

    #[test]
    fn test_decode_single_detection() {
        let mut rows = vec![vec![0.0; 6]; 10];
        rows[3] = vec![100.0, 100.0, 40.0, 20.0, 0.1, 0.9];
        let (data, dims) = channel_major(&rows);

        let dets = decode(&data, &dims, &YoloParams::default()).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "gun");
        assert_eq!(dets[0].class_id, 1);
        assert!((dets[0].score - 0.9).abs() < 1e-6);
        assert_eq!(dets[0].bbox.corners(), (80.0, 90.0, 120.0, 110.0));
    }

    #[test]
    fn test_decode_transposed_layout() {
        // [1, N, 4 + C] with N = 10 anchors, 6 channels.
        let mut data = vec![0.0f32; 10 * 6];
        data[2 * 6..3 * 6].copy_from_slice(&[50.0, 50.0, 10.0, 10.0, 0.8, 0.0]);
        let dims = vec![1, 10, 6];

        let dets = decode(&data, &dims, &YoloParams::default()).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "knife");
    }

    #[test]
    fn test_class_aware_nms() {
        let rows = vec![
            vec![100.0, 100.0, 40.0, 40.0, 0.9, 0.0],
            vec![102.0, 100.0, 40.0, 40.0, 0.8, 0.0], // same class, overlapping -> dropped
            vec![101.0, 100.0, 40.0, 40.0, 0.0, 0.7], // other class, overlapping -> kept
            vec![0.0; 6],
            vec![0.0; 6],
            vec![0.0; 6],
            vec![0.0; 6],
        ];
        let (data, dims) = channel_major(&rows);
        let dets = decode(&data, &dims, &YoloParams::default()).unwrap();
        let summary: Vec<(&str, f32)> = dets.iter().map(|d| (d.label.as_str(), d.score)).collect();
        assert_eq!(summary, vec![("knife", 0.9), ("gun", 0.7)]);
    }

    #[test]
    fn test_unknown_class_name_and_cap() {
        let mut rows = vec![vec![0.0; 7]; 12];
        for (i, row) in rows.iter_mut().enumerate().take(5) {
            *row = vec![20.0 + i as f32 * 100.0, 20.0, 10.0, 10.0, 0.0, 0.0, 0.5 + i as f32 * 0.05];
        }
        let (data, dims) = channel_major(&rows);
        let params = YoloParams {
            max_detections: 3,
            ..YoloParams::default()
        };
        let dets = decode(&data, &dims, &params).unwrap();
        assert_eq!(dets.len(), 3);
        assert!(dets.iter().all(|d| d.label == "class2"));
        assert!(dets[0].score > dets[1].score);
    }

    #[test]
    fn test_boxes_mapped_back_through_letterbox() {
        // 320x160 source letterboxed into 640x640: scale 2, pad_y 160.
        let letterbox = Letterbox::fit(320, 160, 640, 640);
        let rows = vec![
            vec![320.0, 320.0, 100.0, 100.0, 0.95, 0.0],
            vec![0.0; 6],
            vec![0.0; 6],
            vec![0.0; 6],
            vec![0.0; 6],
            vec![0.0; 6],
            vec![0.0; 6],
        ];
        let (data, dims) = channel_major(&rows);
        let params = YoloParams::default();
        let dets = decode_output(&data, &dims, &params, &letterbox, &labels(), (320, 160)).unwrap();
        let (l, t, r, b) = dets[0].bbox.corners();
        assert!((l - 135.0).abs() < 1e-3 && (r - 185.0).abs() < 1e-3);
        assert!((t - 55.0).abs() < 1e-3 && (b - 105.0).abs() < 1e-3);
    }

    #[test]
    fn test_rejects_bad_shape() {
        let err = decode(&[0.0; 8], &[2, 4], &YoloParams::default()).unwrap_err();
        assert!(matches!(err, ObjectDetectorError::UnexpectedShape(_)));
    }

    #[test]
    fn test_read_labels_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xray.labels");
        std::fs::write(&path, "knife\n\n gun \nscissors\n").unwrap();
        assert_eq!(read_labels(&path).unwrap(), vec!["knife", "gun", "scissors"]);
    }
}
