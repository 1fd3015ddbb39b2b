//! vigil-core — Image screening engine.
//!
//! Uses SCRFD for face detection, ArcFace for face embeddings and a
//! YOLO-style detector for X-ray objects, all running via ONNX Runtime
//! for CPU inference. Matches faces against a gallery of persons of
//! interest and writes annotated copies of the inputs.

pub mod alignment;
pub mod annotate;
pub mod detector;
pub mod gallery;
pub mod letterbox;
mod nms;
pub mod objects;
pub mod pipeline;
pub mod recognizer;
pub mod types;
pub mod uploads;

pub use annotate::{AnnotatedImage, Annotator};
pub use detector::{FaceDetect, FaceDetector};
pub use gallery::{Gallery, MissingFacePolicy};
pub use objects::{ObjectDetect, ObjectDetector, YoloParams};
pub use pipeline::{
    check_threshold, FaceReport, InvalidThreshold, MatchSettings, Pipeline, PipelineError,
    XrayReport,
};
pub use recognizer::{FaceEmbed, FaceRecognizer};
pub use types::{
    BoundingBox, DetectedRegion, Embedding, EuclideanMatcher, GalleryEntry, MatchPolicy,
    MatchResult, MatchVerdict, Matcher, ObjectDetection,
};
pub use uploads::{StoredUpload, UploadDir};

use std::path::PathBuf;

/// SCRFD detection model file name.
pub const FACE_DETECTOR_MODEL: &str = "det_10g.onnx";
/// ArcFace recognition model file name.
pub const FACE_RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

/// `$XDG_DATA_HOME/vigil/models`, falling back to `~/.local/share/vigil/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
        .join("models")
}
