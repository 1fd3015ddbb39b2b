//! Greedy non-maximum suppression shared by the face and object detectors.

use crate::types::BoundingBox;
use std::cmp::Ordering;

/// Indices of the boxes that survive suppression, highest confidence first.
pub(crate) fn suppress(boxes: &[BoundingBox], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| {
        boxes[b]
            .confidence
            .partial_cmp(&boxes[a].confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<usize> = Vec::new();
    for idx in order {
        if keep
            .iter()
            .all(|&kept| boxes[kept].iou(&boxes[idx]) <= iou_threshold)
        {
            keep.push(idx);
        }
    }
    keep
}
