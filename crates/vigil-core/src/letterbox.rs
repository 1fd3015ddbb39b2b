//! Aspect-preserving resize onto a fixed-size canvas, and the inverse mapping
//! of model-space coordinates back to the source image.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// Scale and padding used to fit a source image into a model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    /// Size of the resized content inside the canvas.
    pub content_width: u32,
    pub content_height: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl Letterbox {
    /// Fit a `src_w` x `src_h` image centred inside a `dst_w` x `dst_h` canvas.
    pub fn fit(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Self {
        let scale = (dst_w as f32 / src_w.max(1) as f32).min(dst_h as f32 / src_h.max(1) as f32);
        let content_width = ((src_w as f32 * scale).round() as u32).clamp(1, dst_w);
        let content_height = ((src_h as f32 * scale).round() as u32).clamp(1, dst_h);

        Self {
            scale,
            pad_x: (dst_w - content_width) as f32 / 2.0,
            pad_y: (dst_h - content_height) as f32 / 2.0,
            content_width,
            content_height,
            canvas_width: dst_w,
            canvas_height: dst_h,
        }
    }

    /// Resize `image` (bilinear) and paste it onto a canvas filled with `fill`.
    pub fn apply(&self, image: &RgbImage, fill: Rgb<u8>) -> RgbImage {
        let resized = imageops::resize(
            image,
            self.content_width,
            self.content_height,
            FilterType::Triangle,
        );
        let mut canvas = RgbImage::from_pixel(self.canvas_width, self.canvas_height, fill);
        imageops::replace(
            &mut canvas,
            &resized,
            self.pad_x.floor() as i64,
            self.pad_y.floor() as i64,
        );
        canvas
    }

    /// Map a canvas coordinate back into source-image pixels.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x.floor()) / self.scale,
            (y - self.pad_y.floor()) / self.scale,
        )
    }
}
