//! Draws detection boxes and verdict captions onto a copy of the input image.
//!
//! Rendering is split into a layout step (`face_marks` / `object_marks`) that
//! decides every rectangle and caption, and a raster step that draws them.
//! The layout is returned with the written image so callers can report
//! exactly what was drawn.

use crate::types::{DetectedRegion, MatchVerdict};
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const WANTED_CAPTION: &str = "Wanted Criminal";
pub const NO_MATCH_CAPTION: &str = "No criminal match.";

/// Face boxes and "no match" captions.
pub const NEUTRAL_COLOR: [u8; 3] = [0, 0, 255];
/// Captions for matched faces.
pub const WARNING_COLOR: [u8; 3] = [255, 0, 0];

const OBJECT_PALETTE: [[u8; 3]; 8] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
];

const CAPTION_SCALE: f32 = 22.0;
const CAPTION_GAP: i32 = 10;
const BOX_THICKNESS: i32 = 2;

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("cannot read font {path}: {source}")]
    FontIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid font file {0}")]
    InvalidFont(PathBuf),
    #[error("cannot write annotated image {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// A line of text anchored at its top-left corner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Caption {
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub color: [u8; 3],
}

/// One rectangle plus the captions attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mark {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub color: [u8; 3],
    pub captions: Vec<Caption>,
}

/// The written output file and what was drawn on it.
#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedImage {
    pub path: PathBuf,
    pub marks: Vec<Mark>,
}

impl AnnotatedImage {
    /// Every caption in drawing order.
    pub fn captions(&self) -> impl Iterator<Item = &str> {
        self.marks
            .iter()
            .flat_map(|m| m.captions.iter().map(|c| c.text.as_str()))
    }
}

pub struct Annotator {
    font: Option<FontArc>,
    scale: PxScale,
}

impl Annotator {
    /// An annotator that renders captions with `font`, or boxes only when `None`.
    pub fn new(font: Option<FontArc>) -> Self {
        if font.is_none() {
            tracing::warn!("no caption font configured; annotated images will carry boxes only");
        }
        Self {
            font,
            scale: PxScale::from(CAPTION_SCALE),
        }
    }

    /// Load a TrueType/OpenType font from disk.
    pub fn with_font_file(path: &Path) -> Result<Self, AnnotateError> {
        let bytes = std::fs::read(path).map_err(|source| AnnotateError::FontIo {
            path: path.to_path_buf(),
            source,
        })?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|_| AnnotateError::InvalidFont(path.to_path_buf()))?;
        tracing::info!(path = %path.display(), "caption font loaded");
        Ok(Self::new(Some(font)))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    fn text_height(&self) -> i32 {
        self.scale.y.ceil() as i32
    }

    /// Layout for the face path: one box per verdict, captions by match state.
    pub fn face_marks(&self, verdicts: &[MatchVerdict], (width, height): (u32, u32)) -> Vec<Mark> {
        verdicts
            .iter()
            .filter_map(|v| {
                let mut mark = box_mark(&v.region, NEUTRAL_COLOR, width, height)?;
                if v.matched {
                    let name = match (&v.matched_label, &v.matched_id) {
                        (Some(label), Some(id)) => format!("{label} ({id})"),
                        (Some(label), None) => label.clone(),
                        (None, Some(id)) => id.clone(),
                        (None, None) => String::from("unknown"),
                    };
                    mark.captions.push(self.above(&mark, WANTED_CAPTION, WARNING_COLOR, width));
                    mark.captions.push(self.below(&mark, &name, WARNING_COLOR, width, height));
                } else {
                    mark.captions.push(self.above(&mark, NO_MATCH_CAPTION, NEUTRAL_COLOR, width));
                }
                Some(mark)
            })
            .collect()
    }

    /// Layout for the object path: class-coloured box with `label score` above.
    pub fn object_marks(
        &self,
        regions: &[DetectedRegion],
        (width, height): (u32, u32),
    ) -> Vec<Mark> {
        regions
            .iter()
            .filter_map(|region| {
                let label = region.label.as_deref().unwrap_or("object");
                let color = palette_color(label);
                let mut mark = box_mark(region, color, width, height)?;
                let text = match region.score {
                    Some(score) => format!("{label} {score:.2}"),
                    None => label.to_string(),
                };
                mark.captions.push(self.above(&mark, &text, color, width));
                Some(mark)
            })
            .collect()
    }

    fn above(&self, mark: &Mark, text: &str, color: [u8; 3], width: u32) -> Caption {
        Caption {
            text: text.to_string(),
            x: mark.left.clamp(0, width.saturating_sub(1) as i32),
            y: (mark.top - CAPTION_GAP - self.text_height()).max(0),
            color,
        }
    }

    fn below(&self, mark: &Mark, text: &str, color: [u8; 3], width: u32, height: u32) -> Caption {
        let max_y = (height as i32 - self.text_height()).max(0);
        Caption {
            text: text.to_string(),
            x: mark.left.clamp(0, width.saturating_sub(1) as i32),
            y: (mark.bottom + CAPTION_GAP / 2).min(max_y),
            color,
        }
    }

    /// Draw `marks` onto `image` in place.
    pub fn render(&self, image: &mut RgbImage, marks: &[Mark]) {
        for mark in marks {
            for inset in 0..BOX_THICKNESS {
                let w = mark.right - mark.left - 2 * inset;
                let h = mark.bottom - mark.top - 2 * inset;
                if w <= 0 || h <= 0 {
                    break;
                }
                let rect =
                    Rect::at(mark.left + inset, mark.top + inset).of_size(w as u32, h as u32);
                draw_hollow_rect_mut(image, rect, Rgb(mark.color));
            }
            if let Some(font) = &self.font {
                for caption in &mark.captions {
                    draw_text_mut(
                        image,
                        Rgb(caption.color),
                        caption.x,
                        caption.y,
                        self.scale,
                        font,
                        &caption.text,
                    );
                }
            }
        }
    }

    /// Render `marks` onto a copy of `source` and write it to `output`.
    ///
    /// The source raster is never modified.
    pub fn annotate(
        &self,
        source: &RgbImage,
        marks: Vec<Mark>,
        output: &Path,
    ) -> Result<AnnotatedImage, AnnotateError> {
        let mut canvas = source.clone();
        self.render(&mut canvas, &marks);
        canvas.save(output).map_err(|source| AnnotateError::Write {
            path: output.to_path_buf(),
            source,
        })?;

        tracing::info!(path = %output.display(), marks = marks.len(), "annotated image written");
        Ok(AnnotatedImage {
            path: output.to_path_buf(),
            marks,
        })
    }
}

/// Integer rectangle for a region, clipped to the image; `None` if it vanishes.
fn box_mark(region: &DetectedRegion, color: [u8; 3], width: u32, height: u32) -> Option<Mark> {
    let (l, t, r, b) = region.bbox.clamp_to(width, height).corners();
    let mark = Mark {
        left: l.round() as i32,
        top: t.round() as i32,
        right: r.round() as i32,
        bottom: b.round() as i32,
        color,
        captions: Vec::new(),
    };
    (mark.right > mark.left && mark.bottom > mark.top).then_some(mark)
}

/// Stable per-label colour.
fn palette_color(label: &str) -> [u8; 3] {
    // FNV-1a
    let hash = label
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
    OBJECT_PALETTE[(hash % OBJECT_PALETTE.len() as u64) as usize]
}
