use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Axis-aligned box in source-image pixels, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Build a box from `(left, top, right, bottom)` corners.
    pub fn from_corners(left: f32, top: f32, right: f32, bottom: f32, confidence: f32) -> Self {
        Self {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
            confidence,
            landmarks: None,
        }
    }

    /// Corners as `(left, top, right, bottom)`.
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        (self.x, self.y, self.x + self.width, self.y + self.height)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box, 0.0 for degenerate unions.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let (al, at, ar, ab) = self.corners();
        let (bl, bt, br, bb) = other.corners();

        let inter_w = (ar.min(br) - al.max(bl)).max(0.0);
        let inter_h = (ab.min(bb) - at.max(bt)).max(0.0);
        let inter = inter_w * inter_h;

        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Clip the box to a `width` x `height` image. Landmarks are left untouched.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let (l, t, r, b) = self.corners();
        let (w, h) = (width as f32, height as f32);
        let mut clipped = BoundingBox::from_corners(
            l.clamp(0.0, w),
            t.clamp(0.0, h),
            r.clamp(0.0, w),
            b.clamp(0.0, h),
            self.confidence,
        );
        clipped.landmarks = self.landmarks;
        clipped
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance, or `None` when the two vectors differ in length.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }
}

/// One known identity in the watchlist gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    /// Reference identifier (case number), unique within a gallery.
    pub id: String,
    /// Display name.
    pub label: String,
    #[serde(skip_serializing)]
    pub embedding: Embedding,
}

/// A labelled box produced by the object detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDetection {
    pub label: String,
    pub class_id: usize,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// A region found in a request image, either a face or an object.
#[derive(Debug, Clone, Serialize)]
pub struct DetectedRegion {
    pub bbox: BoundingBox,
    /// Present only for face regions.
    #[serde(skip)]
    pub embedding: Option<Embedding>,
    /// Present only for object-detector regions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl DetectedRegion {
    pub fn face(bbox: BoundingBox, embedding: Embedding) -> Self {
        Self {
            score: Some(bbox.confidence),
            bbox,
            embedding: Some(embedding),
            label: None,
        }
    }

    pub fn object(detection: ObjectDetection) -> Self {
        Self {
            bbox: detection.bbox,
            embedding: None,
            label: Some(detection.label),
            score: Some(detection.score),
        }
    }
}

/// Outcome of comparing one query embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance of the deciding entry; when nothing matched, the smallest
    /// distance seen. `None` only when no entry was comparable.
    pub distance: Option<f32>,
    pub matched_id: Option<String>,
    pub matched_label: Option<String>,
}

impl MatchResult {
    pub fn no_match(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            distance,
            matched_id: None,
            matched_label: None,
        }
    }
}

/// Per-region verdict handed to the annotator.
#[derive(Debug, Clone, Serialize)]
pub struct MatchVerdict {
    pub region: DetectedRegion,
    pub matched: bool,
    pub matched_label: Option<String>,
    pub matched_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

impl MatchVerdict {
    pub fn new(region: DetectedRegion, result: MatchResult) -> Self {
        Self {
            region,
            matched: result.matched,
            matched_label: result.matched_label,
            matched_id: result.matched_id,
            distance: result.distance,
        }
    }
}

/// Which qualifying gallery entry wins when several are under the threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// First entry in gallery order whose distance clears the threshold.
    #[default]
    First,
    /// Entry with the smallest distance; ties keep the earlier entry.
    Nearest,
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first-match" => Ok(MatchPolicy::First),
            "nearest" | "best" => Ok(MatchPolicy::Nearest),
            other => Err(format!(
                "unknown match policy {other:?} (expected \"first\" or \"nearest\")"
            )),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::First => f.write_str("first"),
            MatchPolicy::Nearest => f.write_str("nearest"),
        }
    }
}

/// Strategy for comparing a query embedding against a gallery of known faces.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Euclidean-distance matcher over L2-normalised embeddings.
///
/// An entry qualifies when its distance is strictly below the threshold.
/// Entries whose dimension differs from the query, or whose distance is NaN,
/// are never candidates. A NaN threshold matches nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher {
    pub policy: MatchPolicy,
}

impl EuclideanMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut winner: Option<(usize, f32)> = None;
        let mut closest: Option<f32> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let Some(distance) = query.euclidean_distance(&entry.embedding) else {
                tracing::warn!(
                    id = %entry.id,
                    query_dim = query.len(),
                    entry_dim = entry.embedding.len(),
                    "embedding dimension mismatch; entry skipped"
                );
                continue;
            };
            if distance.is_nan() {
                tracing::warn!(id = %entry.id, "distance is NaN; entry skipped");
                continue;
            }
            closest = Some(closest.map_or(distance, |c| c.min(distance)));

            // False for a NaN threshold.
            let qualifies = distance < threshold;
            if !qualifies {
                continue;
            }
            match self.policy {
                MatchPolicy::First => {
                    winner = Some((i, distance));
                    break;
                }
                MatchPolicy::Nearest => {
                    if winner.map_or(true, |(_, best)| distance < best) {
                        winner = Some((i, distance));
                    }
                }
            }
        }

        match winner {
            Some((idx, distance)) => MatchResult {
                matched: true,
                distance: Some(distance),
                matched_id: Some(gallery[idx].id.clone()),
                matched_label: Some(gallery[idx].label.clone()),
            },
            None => MatchResult::no_match(closest),
        }
    }
}
