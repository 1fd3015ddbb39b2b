//! Face alignment via 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the ArcFace reference template and
//! warps the face into a canonical 112×112 crop.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// ArcFace reference landmarks for a 112×112 output.
pub(crate) const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + [tx; ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit of `src` onto `dst` (no reflection).
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut var = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (px, py) = (sx - msx, sy - msy);
            let (qx, qy) = (dx - mdx, dy - mdy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            var += px * px + py * py;
        }
        if var < 1e-9 {
            return None;
        }

        let a = dot / var;
        let b = cross / var;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn projection(&self) -> Option<Projection> {
        Projection::from_matrix([
            self.a, -self.b, self.tx, //
            self.b, self.a, self.ty, //
            0.0, 0.0, 1.0,
        ])
    }
}

/// Align a detected face to a canonical 112×112 crop using its landmarks.
///
/// Returns `None` when the landmarks are degenerate (all coincident).
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112)?;
    let projection = transform.projection()?;

    let mut aligned = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    warp_into(
        image,
        &projection,
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
        &mut aligned,
    );
    Some(aligned)
}

/// Crop the bounding box and resize it to 112×112, for faces without landmarks.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    let (w, h) = image.dimensions();
    let (l, t, r, b) = face.clamp_to(w, h).corners();
    let x = l.floor() as u32;
    let y = t.floor() as u32;
    let cw = ((r - l).round() as u32).max(1).min(w.saturating_sub(x).max(1));
    let ch = ((b - t).round() as u32).max(1).min(h.saturating_sub(y).max(1));

    let x = x.min(w.saturating_sub(1));
    let y = y.min(h.saturating_sub(1));
    let crop = imageops::crop_imm(image, x, y, cw, ch).to_image();
    imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
}
