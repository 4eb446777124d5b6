//! Result assembly: ordering, diagnostic annotation and output records.

use crate::frame::Frame;
use crate::source::ImageTarget;
use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use common::plates::{BoundingBox, CarEvent, Detection, PlateRecord, RecognizedPlate};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::warn;

const PLATE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const VEHICLE_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const PLATE_BOX_THICKNESS: u32 = 3;
const VEHICLE_BOX_THICKNESS: u32 = 2;
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: u32 = 24;
const LABEL_CHAR_WIDTH: u32 = 11; // rough per-character width when no font is loaded
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;

/// Label font compiled into the binary, overridden by `LPR_LABEL_FONT`
static DEFAULT_LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono-Bold.ttf");

/// Everything one pipeline run produced
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Validated plates in discovery order
    pub plates: Vec<RecognizedPlate>,

    /// Vehicles that restricted the search
    pub vehicles: Vec<Detection>,

    /// Copy of the input with boxes and labels drawn on it
    pub annotated_image: Frame,
}

impl PipelineOutput {
    pub fn is_empty(&self) -> bool {
        self.plates.is_empty()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.plates.iter().map(|p| p.text.as_str()).collect()
    }

    /// One downstream record per plate
    pub fn records(
        &self,
        event: CarEvent,
        image_path: Option<&Path>,
        captured_at: DateTime<Local>,
    ) -> Vec<PlateRecord> {
        let image_path = image_path.map(|p| p.display().to_string());
        let timestamp = captured_at.to_rfc3339();
        self.plates
            .iter()
            .map(|plate| PlateRecord::from_plate(plate, event, image_path.clone(), timestamp.clone()))
            .collect()
    }
}

/// Draws results onto a private copy of the frame
#[derive(Clone)]
pub struct ResultAssembler {
    font: Option<FontArc>,
}

impl Default for ResultAssembler {
    fn default() -> Self {
        let font = match FontArc::try_from_slice(DEFAULT_LABEL_FONT) {
            Ok(font) => Some(font),
            Err(e) => {
                warn!(error = %e, "Embedded label font unusable, labels drawn without text");
                None
            }
        };
        Self { font }
    }
}

impl ResultAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font(font: FontArc) -> Self {
        Self { font: Some(font) }
    }

    /// Load a TTF/OTF font for the text labels
    pub fn load_font(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read label font {}", path.display()))?;
        let font = FontArc::try_from_vec(data)
            .map_err(|e| anyhow::anyhow!("Invalid font {}: {}", path.display(), e))?;
        Ok(Self::with_font(font))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn assemble(
        &self,
        frame: &Frame,
        plates: Vec<RecognizedPlate>,
        vehicles: Vec<Detection>,
    ) -> PipelineOutput {
        let mut canvas = frame.to_rgb();

        for vehicle in &vehicles {
            draw_box(&mut canvas, &vehicle.bbox, VEHICLE_COLOR, VEHICLE_BOX_THICKNESS);
        }
        for plate in &plates {
            draw_box(&mut canvas, &plate.bbox, PLATE_COLOR, PLATE_BOX_THICKNESS);
            self.draw_label(&mut canvas, &plate.bbox, &plate.text);
        }

        PipelineOutput {
            plates,
            vehicles,
            annotated_image: Frame::new(canvas, frame.source().map(str::to_string)),
        }
    }

    /// Filled tab above the box with the plate text on it
    fn draw_label(&self, canvas: &mut RgbImage, bbox: &BoundingBox, text: &str) {
        let scale = PxScale::from(LABEL_FONT_SIZE);
        let text_width = match &self.font {
            Some(font) => text_size(scale, font, text).0 + 4,
            None => text.len() as u32 * LABEL_CHAR_WIDTH,
        };

        let label_x = bbox.x;
        let label_y = bbox.y.saturating_sub(LABEL_TEXT_HEIGHT);
        let label_width = text_width.min(canvas.width().saturating_sub(label_x));
        let label_height = LABEL_TEXT_HEIGHT.min(canvas.height().saturating_sub(label_y));
        if label_width == 0 || label_height == 0 {
            return;
        }

        let rect = Rect::at(label_x as i32, label_y as i32).of_size(label_width, label_height);
        draw_filled_rect_mut(canvas, rect, PLATE_COLOR);

        if let Some(font) = &self.font {
            draw_text_mut(
                canvas,
                LABEL_TEXT_COLOR,
                label_x as i32 + 2,
                label_y as i32 + LABEL_TEXT_VERTICAL_PADDING,
                scale,
                font,
                text,
            );
        }
    }
}

/// Hollow rectangle drawn inward from the box edge
fn draw_box(canvas: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    let Some(bbox) = bbox.clip_to(canvas.width(), canvas.height()) else {
        return;
    };
    for inset in 0..thickness {
        if bbox.width <= 2 * inset || bbox.height <= 2 * inset {
            break;
        }
        let rect = Rect::at((bbox.x + inset) as i32, (bbox.y + inset) as i32)
            .of_size(bbox.width - 2 * inset, bbox.height - 2 * inset);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

/// Capture timestamps carry milliseconds so overlapping cycles never share a file
const CAPTURE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

/// File name of the annotated image written for `target`
pub fn annotated_file_name(target: &ImageTarget, captured_at: DateTime<Local>) -> String {
    match target {
        ImageTarget::File(path) => match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => format!("result_{}", name),
            None => format!("result_{}.jpg", captured_at.format(CAPTURE_STAMP_FORMAT)),
        },
        ImageTarget::Camera => format!("capture_{}.jpg", captured_at.format(CAPTURE_STAMP_FORMAT)),
    }
}
