//! Detection orchestration: decode → detect → match → annotate → write.
//!
//! A [`Pipeline`] holds only read-only state (gallery, matcher settings,
//! annotator) and is shared across workers. The model collaborators are
//! passed in per call so each worker can own its own instances.

use crate::annotate::{AnnotateError, AnnotatedImage, Annotator};
use crate::detector::{DetectorError, FaceDetect};
use crate::gallery::{Gallery, GalleryError, MissingFacePolicy};
use crate::objects::{ObjectDetect, ObjectDetectorError};
use crate::recognizer::{FaceEmbed, RecognizerError};
use crate::types::{
    DetectedRegion, EuclideanMatcher, MatchPolicy, MatchResult, MatchVerdict, Matcher,
};
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Euclidean threshold for unit-length ArcFace embeddings (cosine ≈ 0.395).
pub const DEFAULT_MATCH_THRESHOLD: f32 = 1.10;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("face recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("object detector: {0}")]
    Objects(#[from] ObjectDetectorError),
    #[error("recognizer returned {embeddings} embeddings for {boxes} faces")]
    Misaligned { boxes: usize, embeddings: usize },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cannot decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("annotated image not persisted: {0}")]
    Write(#[from] AnnotateError),
    #[error("gallery load failed: {0}")]
    GalleryLoad(#[from] GalleryError),
    #[error(transparent)]
    Settings(#[from] InvalidThreshold),
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("match threshold must be a finite number above zero, got {0}")]
pub struct InvalidThreshold(pub f32);

/// Accept only finite thresholds above zero.
pub fn check_threshold(threshold: f32) -> Result<f32, InvalidThreshold> {
    if threshold.is_finite() && threshold > 0.0 {
        Ok(threshold)
    } else {
        Err(InvalidThreshold(threshold))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchSettings {
    pub threshold: f32,
    pub policy: MatchPolicy,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            policy: MatchPolicy::default(),
        }
    }
}

/// Result of the face path.
#[derive(Debug, Clone, Serialize)]
pub struct FaceReport {
    pub output: AnnotatedImage,
    pub verdicts: Vec<MatchVerdict>,
    pub elapsed_ms: u128,
}

impl FaceReport {
    pub fn matches(&self) -> impl Iterator<Item = &MatchVerdict> {
        self.verdicts.iter().filter(|v| v.matched)
    }
}

/// Result of the X-ray path.
#[derive(Debug, Clone, Serialize)]
pub struct XrayReport {
    pub output: AnnotatedImage,
    pub regions: Vec<DetectedRegion>,
    pub elapsed_ms: u128,
}

pub struct Pipeline {
    gallery: Arc<Gallery>,
    matcher: EuclideanMatcher,
    threshold: f32,
    annotator: Annotator,
}

impl Pipeline {
    pub fn new(
        gallery: Arc<Gallery>,
        settings: MatchSettings,
        annotator: Annotator,
    ) -> Result<Self, PipelineError> {
        let threshold = check_threshold(settings.threshold)?;
        tracing::info!(
            gallery = gallery.len(),
            threshold = settings.threshold,
            policy = %settings.policy,
            "pipeline ready"
        );
        Ok(Self {
            gallery,
            matcher: EuclideanMatcher::new(settings.policy),
            threshold,
            annotator,
        })
    }

    /// Build the gallery from reference images with the given collaborators.
    ///
    /// Runs once at startup, before any request is served.
    pub fn load_gallery(
        dir: &Path,
        detector: &mut dyn FaceDetect,
        recognizer: &mut dyn FaceEmbed,
        missing_face: MissingFacePolicy,
    ) -> Result<Gallery, PipelineError> {
        Ok(Gallery::load(dir, detector, recognizer, missing_face)?)
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn settings(&self) -> MatchSettings {
        MatchSettings {
            threshold: self.threshold,
            policy: self.matcher.policy,
        }
    }

    /// Load an image file as RGB.
    pub fn decode_image(path: &Path) -> Result<RgbImage, PipelineError> {
        let image = image::open(path).map_err(|source| PipelineError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(image.to_rgb8())
    }

    /// Face boxes zipped with their embeddings.
    ///
    /// The recognizer must return exactly one embedding per box; anything
    /// else is a collaborator failure and no regions are returned.
    pub fn detect_faces(
        &self,
        detector: &mut dyn FaceDetect,
        recognizer: &mut dyn FaceEmbed,
        image: &RgbImage,
    ) -> Result<Vec<DetectedRegion>, PipelineError> {
        let boxes = detector.detect_faces(image).map_err(CollaboratorError::from)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = recognizer
            .embed_faces(image, &boxes)
            .map_err(CollaboratorError::from)?;

        if embeddings.len() != boxes.len() {
            return Err(CollaboratorError::Misaligned {
                boxes: boxes.len(),
                embeddings: embeddings.len(),
            }
            .into());
        }

        Ok(boxes
            .into_iter()
            .zip(embeddings)
            .map(|(bbox, embedding)| DetectedRegion::face(bbox, embedding))
            .collect())
    }

    /// Object detector output mapped one-to-one into regions.
    pub fn detect_objects(
        &self,
        detector: &mut dyn ObjectDetect,
        image: &RgbImage,
    ) -> Result<Vec<DetectedRegion>, PipelineError> {
        let detections = detector.detect_objects(image).map_err(CollaboratorError::from)?;
        Ok(detections.into_iter().map(DetectedRegion::object).collect())
    }

    /// One verdict per region, compared against the gallery.
    pub fn match_regions(&self, regions: Vec<DetectedRegion>) -> Vec<MatchVerdict> {
        regions
            .into_iter()
            .map(|region| {
                let result = match &region.embedding {
                    Some(embedding) => {
                        self.matcher
                            .compare(embedding, self.gallery.entries(), self.threshold)
                    }
                    None => MatchResult::no_match(None),
                };
                if result.matched {
                    tracing::warn!(
                        id = result.matched_id.as_deref().unwrap_or_default(),
                        label = result.matched_label.as_deref().unwrap_or_default(),
                        distance = result.distance,
                        "watchlist match"
                    );
                } else {
                    tracing::debug!(closest = result.distance, "no watchlist match");
                }
                MatchVerdict::new(region, result)
            })
            .collect()
    }

    /// Full face path for the image at `input`, writing the result to `output`.
    pub fn run_face(
        &self,
        input: &Path,
        output: &Path,
        detector: &mut dyn FaceDetect,
        recognizer: &mut dyn FaceEmbed,
    ) -> Result<FaceReport, PipelineError> {
        let started = Instant::now();
        let image = Self::decode_image(input)?;

        let regions = self.detect_faces(detector, recognizer, &image)?;
        let verdicts = self.match_regions(regions);
        let marks = self.annotator.face_marks(&verdicts, image.dimensions());
        let annotated = self.annotator.annotate(&image, marks, output)?;

        let elapsed_ms = started.elapsed().as_millis();
        tracing::info!(
            input = %input.display(),
            faces = verdicts.len(),
            matches = verdicts.iter().filter(|v| v.matched).count(),
            elapsed_ms,
            "face pipeline finished"
        );
        Ok(FaceReport {
            output: annotated,
            verdicts,
            elapsed_ms,
        })
    }

    /// Full X-ray path for the image at `input`, writing the result to `output`.
    pub fn run_xray(
        &self,
        input: &Path,
        output: &Path,
        detector: &mut dyn ObjectDetect,
    ) -> Result<XrayReport, PipelineError> {
        let started = Instant::now();
        let image = Self::decode_image(input)?;

        let regions = self.detect_objects(detector, &image)?;
        let marks = self.annotator.object_marks(&regions, image.dimensions());
        let annotated = self.annotator.annotate(&image, marks, output)?;

        let elapsed_ms = started.elapsed().as_millis();
        tracing::info!(
            input = %input.display(),
            objects = regions.len(),
            elapsed_ms,
            "xray pipeline finished"
        );
        Ok(XrayReport {
            output: annotated,
            regions,
            elapsed_ms,
        })
    }
}
