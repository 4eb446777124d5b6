use crate::error::PipelineError;
use anyhow::{Context, Result};
use common::plates::BoundingBox;
use image::{DynamicImage, RgbImage};
use std::path::Path;

/// An immutable raster plus the place it came from.
///
/// Frames are never mutated in place; `crop` and `to_rgb` hand out independent copies.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: RgbImage,
    source: Option<String>,
}

impl Frame {
    pub fn new(pixels: RgbImage, source: Option<String>) -> Self {
        Self { pixels, source }
    }

    /// Decode encoded image bytes (JPEG, PNG, ...) into a frame
    pub fn decode(bytes: &[u8], source: Option<String>) -> Result<Self, PipelineError> {
        let source_id = source.clone().unwrap_or_else(|| "<memory>".to_string());
        if bytes.is_empty() {
            return Err(PipelineError::decode(source_id, "empty image body"));
        }
        let image = image::load_from_memory(bytes)
            .map_err(|e| PipelineError::decode(source_id, e.to_string()))?;
        Ok(Self::new(image.to_rgb8(), source))
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    /// Owned copy of the pixel buffer, for drawing
    pub fn to_rgb(&self) -> RgbImage {
        self.pixels.clone()
    }

    pub fn to_dynamic(&self) -> DynamicImage {
        DynamicImage::ImageRgb8(self.pixels.clone())
    }

    /// Box covering the whole frame
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(0, 0, self.width(), self.height())
    }

    /// Copy out the region under `bbox`, clipped to the frame. `None` if nothing is left.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<Frame> {
        let clipped = bbox.clip_to(self.width(), self.height())?;
        let view = image::imageops::crop_imm(
            &self.pixels,
            clipped.x,
            clipped.y,
            clipped.width,
            clipped.height,
        );
        Some(Frame {
            pixels: view.to_image(),
            source: self.source.clone(),
        })
    }

    /// Encode to `path`; the format follows the extension and falls back to JPEG
    pub fn save(&self, path: &Path) -> Result<()> {
        let format = image::ImageFormat::from_path(path).unwrap_or(image::ImageFormat::Jpeg);
        self.pixels
            .save_with_format(path, format)
            .with_context(|| format!("Failed to write image to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> Frame {
        let pixels = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 7]));
        Frame::new(pixels, Some("test".to_string()))
    }

    #[test]
    fn test_crop_is_independent_copy() {
        let frame = gradient(64, 32);
        let crop = frame.crop(&BoundingBox::new(10, 5, 20, 10)).unwrap();

        assert_eq!(crop.width(), 20);
        assert_eq!(crop.height(), 10);
        assert_eq!(crop.pixels().get_pixel(0, 0), &Rgb([10, 5, 7]));

        let mut drawn = crop.to_rgb();
        drawn.put_pixel(0, 0, Rgb([255, 255, 255]));
        assert_eq!(frame.pixels().get_pixel(10, 5), &Rgb([10, 5, 7]));
        assert_eq!(crop.pixels().get_pixel(0, 0), &Rgb([10, 5, 7]));
    }

    #[test]
    fn test_crop_clips_to_bounds() {
        let frame = gradient(64, 32);
        let crop = frame.crop(&BoundingBox::new(50, 20, 40, 40)).unwrap();
        assert_eq!((crop.width(), crop.height()), (14, 12));

        assert!(frame.crop(&BoundingBox::new(64, 0, 5, 5)).is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = Frame::decode(b"definitely not a jpeg", Some("camera".to_string())).unwrap_err();
        assert!(matches!(err, PipelineError::DecodeError { .. }));

        let err = Frame::decode(&[], None).unwrap_err();
        assert!(matches!(err, PipelineError::DecodeError { .. }));
    }

    #[test]
    fn test_save_and_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let frame = gradient(16, 8);
        frame.save(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let decoded = Frame::decode(&bytes, None).unwrap();
        assert_eq!(decoded.pixels(), frame.pixels());
    }
}
