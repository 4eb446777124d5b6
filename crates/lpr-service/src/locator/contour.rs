//! Edge/contour plate localisation without a learned model.
//!
//! grayscale -> Gaussian blur -> Canny -> 1px dilation -> outer contours, then
//! shape filters on each contour's bounding box. Identical pixels always give
//! identical candidates.

use crate::config::PipelineConfig;
use crate::frame::Frame;
use common::plates::{BoundingBox, Detection, DetectionLabel};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::distance_transform::Norm;
use std::cmp::Ordering;

/// Minimum contour area / bounding-box area for a plate-like outline
pub const MIN_RECTANGULARITY: f32 = 0.6;

/// Candidates overlapping more than this are treated as the same plate
const SUPPRESSION_IOU: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct ContourLocator {
    pub min_aspect_ratio: f32,
    pub max_aspect_ratio: f32,
    pub min_area: u32,
    pub blur_sigma: f32,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl ContourLocator {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            min_aspect_ratio: config.min_plate_aspect_ratio,
            max_aspect_ratio: config.max_plate_aspect_ratio,
            min_area: config.min_plate_area,
            blur_sigma: 1.4,
            canny_low: 50.0,
            canny_high: 100.0,
        }
    }

    /// Plate-region candidates in `crop` coordinates, top-to-bottom then left-to-right
    pub fn locate(&self, crop: &Frame) -> Vec<Detection> {
        let gray = image::imageops::grayscale(crop.pixels());
        let blurred = imageproc::filter::gaussian_blur_f32(&gray, self.blur_sigma);
        let edges = imageproc::edges::canny(&blurred, self.canny_low, self.canny_high);
        // Close one-pixel gaps so plate borders form a single outline
        let closed = imageproc::morphology::dilate(&edges, Norm::LInf, 1);

        let contours = find_contours::<u32>(&closed);

        let mut scored: Vec<(BoundingBox, f32)> = contours
            .iter()
            .filter(|c| c.border_type == BorderType::Outer)
            .filter_map(|c| self.score(c))
            .collect();

        // Stable: equal rectangularity keeps discovery order
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let mut kept: Vec<(BoundingBox, f32)> = Vec::new();
        for (bbox, rectangularity) in scored {
            if kept
                .iter()
                .all(|(other, _)| other.iou(&bbox) <= SUPPRESSION_IOU)
            {
                kept.push((bbox, rectangularity));
            }
        }

        kept.sort_by_key(|(bbox, _)| (bbox.y, bbox.x, bbox.width, bbox.height));

        kept.into_iter()
            .filter_map(|(bbox, rectangularity)| {
                let bbox = bbox.clip_to(crop.width(), crop.height())?;
                Some(Detection::new(
                    DetectionLabel::PlateRegion,
                    rectangularity_confidence(rectangularity),
                    bbox,
                ))
            })
            .collect()
    }

    /// Bounding box and rectangularity of a contour that passes the shape filters
    fn score(&self, contour: &Contour<u32>) -> Option<(BoundingBox, f32)> {
        let bbox = contour_bounds(contour)?;

        let aspect = bbox.aspect_ratio();
        if aspect < self.min_aspect_ratio || aspect > self.max_aspect_ratio {
            return None;
        }
        if bbox.area() < self.min_area as u64 {
            return None;
        }

        let rectangularity = (polygon_area(contour) / bbox.area() as f64) as f32;
        if rectangularity < MIN_RECTANGULARITY {
            return None;
        }
        Some((bbox, rectangularity.min(1.0)))
    }
}

/// Map rectangularity in [0.6, 1.0] onto a [0, 1] confidence
pub fn rectangularity_confidence(rectangularity: f32) -> f32 {
    ((rectangularity - MIN_RECTANGULARITY) / (1.0 - MIN_RECTANGULARITY)).clamp(0.0, 1.0)
}

/// Inclusive pixel bounds of a contour
fn contour_bounds(contour: &Contour<u32>) -> Option<BoundingBox> {
    let first = contour.points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &contour.points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Some(BoundingBox::new(
        min_x,
        min_y,
        max_x - min_x + 1,
        max_y - min_y + 1,
    ))
}

/// Shoelace area of the closed polygon through the contour points
fn polygon_area(contour: &Contour<u32>) -> f64 {
    let points = &contour.points;
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0.0f64;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        twice_area += p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
    }
    twice_area.abs() / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn locator() -> ContourLocator {
        ContourLocator::from_config(&PipelineConfig::default())
    }

    /// Dark background with light filled rectangles
    fn scene(width: u32, height: u32, rects: &[(i32, i32, u32, u32)]) -> Frame {
        let mut pixels = RgbImage::from_pixel(width, height, Rgb([20, 20, 20]));
        for &(x, y, w, h) in rects {
            draw_filled_rect_mut(&mut pixels, Rect::at(x, y).of_size(w, h), Rgb([235, 235, 235]));
        }
        Frame::new(pixels, None)
    }

    #[test]
    fn test_finds_plate_shaped_rectangle() {
        let frame = scene(200, 100, &[(40, 35, 120, 30)]);
        let candidates = locator().locate(&frame);

        assert_eq!(candidates.len(), 1);
        let plate = &candidates[0];
        assert_eq!(plate.label, DetectionLabel::PlateRegion);
        assert!(plate.confidence > 0.5);
        assert!(plate.bbox.is_within(200, 100));
        // Outline sits on the rectangle border, give or take the edge/dilation width
        assert!(plate.bbox.x.abs_diff(40) <= 3);
        assert!(plate.bbox.y.abs_diff(35) <= 3);
        assert!(plate.bbox.width.abs_diff(120) <= 6);
        assert!(plate.bbox.height.abs_diff(30) <= 6);
    }

    #[test]
    fn test_rejects_wrong_aspect_and_small_shapes() {
        // Square (aspect 1) and a tiny plate-shaped sliver below min area
        let frame = scene(240, 120, &[(20, 20, 60, 60), (150, 40, 30, 8)]);
        assert!(locator().locate(&frame).is_empty());
    }

    #[test]
    fn test_blank_image_has_no_candidates() {
        let frame = scene(160, 90, &[]);
        assert!(locator().locate(&frame).is_empty());
    }

    #[test]
    fn test_deterministic_and_ordered() {
        let frame = scene(320, 200, &[(170, 20, 100, 30), (30, 130, 110, 32)]);
        let first = locator().locate(&frame);
        let second = locator().locate(&frame);

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(first[0].bbox.y < first[1].bbox.y);
    }

    #[test]
    fn test_rectangularity_confidence() {
        assert_eq!(rectangularity_confidence(0.6), 0.0);
        assert_eq!(rectangularity_confidence(1.0), 1.0);
        assert!((rectangularity_confidence(0.8) - 0.5).abs() < 1e-6);
        assert_eq!(rectangularity_confidence(1.3), 1.0);
    }

    #[test]
    fn test_polygon_area() {
        use imageproc::point::Point;
        let contour = Contour {
            points: vec![
                Point::new(0u32, 0u32),
                Point::new(10, 0),
                Point::new(10, 4),
                Point::new(0, 4),
            ],
            border_type: BorderType::Outer,
            parent: None,
        };
        assert_eq!(polygon_area(&contour), 40.0);
        assert_eq!(contour_bounds(&contour), Some(BoundingBox::new(0, 0, 11, 5)));
    }
}
