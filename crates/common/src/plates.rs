//! Plate recognition contracts shared between the pipeline and its collaborators.
//!
//! This module defines the geometric primitives, detection results, recognized
//! plates and the output record handed to downstream storage/dashboard consumers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box coordinates (x, y, width, height) in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a box from corner coordinates, clamping negatives to zero
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let left = x1.min(x2).max(0.0);
        let top = y1.min(y2).max(0.0);
        let right = x1.max(x2).max(0.0);
        let bottom = y1.max(y2).max(0.0);
        Self {
            x: left.floor() as u32,
            y: top.floor() as u32,
            width: (right - left.floor()).ceil() as u32,
            height: (bottom - top.floor()).ceil() as u32,
        }
    }

    /// Exclusive right edge
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width divided by height; zero for degenerate boxes
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f32 / self.height as f32
    }

    /// True when the box lies entirely inside a `width` x `height` raster
    pub fn is_within(&self, width: u32, height: u32) -> bool {
        self.right() <= width as u64 && self.bottom() <= height as u64
    }

    /// Clip the box to a `width` x `height` raster. Returns `None` when nothing is left.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let right = self.right().min(width as u64) as u32;
        let bottom = self.bottom().min(height as u64) as u32;
        let clipped = BoundingBox {
            x: self.x,
            y: self.y,
            width: right - self.x,
            height: bottom - self.y,
        };
        if clipped.is_empty() {
            None
        } else {
            Some(clipped)
        }
    }

    /// Shift a box computed on a crop back into the coordinates of its parent
    pub fn offset_by(&self, origin: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x: self.x.saturating_add(origin.x),
            y: self.y.saturating_add(origin.y),
            width: self.width,
            height: self.height,
        }
    }

    /// Intersection over Union
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x) as u64;
        let y1 = self.y.max(other.y) as u64;
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        let intersection = if x2 > x1 && y2 > y1 {
            ((x2 - x1) * (y2 - y1)) as f32
        } else {
            0.0
        };

        let union = self.area() as f32 + other.area() as f32 - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    pub fn to_array(&self) -> [u32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

impl From<BoundingBox> for [u32; 4] {
    fn from(bbox: BoundingBox) -> Self {
        bbox.to_array()
    }
}

/// Vehicle classes the vehicle detector may report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Car,
    Bus,
    Truck,
    Motorcycle,
}

impl VehicleClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleClass::Car => "car",
            VehicleClass::Bus => "bus",
            VehicleClass::Truck => "truck",
            VehicleClass::Motorcycle => "motorcycle",
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "car" => Ok(VehicleClass::Car),
            "bus" => Ok(VehicleClass::Bus),
            "truck" => Ok(VehicleClass::Truck),
            "motorcycle" | "motorbike" => Ok(VehicleClass::Motorcycle),
            _ => Err(format!("Invalid vehicle class: {}", s)),
        }
    }
}

/// What a detection box contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "class")]
pub enum DetectionLabel {
    Vehicle(VehicleClass),
    PlateRegion,
}

impl DetectionLabel {
    /// Map a model class name onto a label. Unknown classes yield `None`.
    pub fn from_class_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase();
        match normalized.as_str() {
            "plate" | "license_plate" | "license-plate" | "licence_plate" | "number_plate" => {
                Some(DetectionLabel::PlateRegion)
            }
            other => other.parse::<VehicleClass>().ok().map(DetectionLabel::Vehicle),
        }
    }

    pub fn is_vehicle(&self) -> bool {
        matches!(self, DetectionLabel::Vehicle(_))
    }
}

impl fmt::Display for DetectionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionLabel::Vehicle(class) => write!(f, "{}", class),
            DetectionLabel::PlateRegion => f.write_str("plate"),
        }
    }
}

/// Detection result from a detector or plate locator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Detected object label
    pub label: DetectionLabel,

    /// Detection confidence (0.0 to 1.0)
    pub confidence: f32,

    /// Bounding box, always within the frame it was computed on
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: DetectionLabel, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label,
            confidence,
            bbox,
        }
    }
}

/// A validated plate, in original-image coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedPlate {
    /// Validated plate text (uppercase ASCII alphanumerics)
    pub text: String,

    /// OCR confidence of the read, before any character correction
    pub confidence: f32,

    /// Plate box in original-image coordinates
    #[serde(rename = "box")]
    pub bbox: BoundingBox,

    /// Box of the vehicle the plate was found on, if any
    pub vehicle_box: Option<BoundingBox>,
}

/// Car movement recorded by the downstream log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarEvent {
    #[default]
    Enter,
    Exit,
}

impl fmt::Display for CarEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CarEvent::Enter => f.write_str("enter"),
            CarEvent::Exit => f.write_str("exit"),
        }
    }
}

impl FromStr for CarEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "enter" => Ok(CarEvent::Enter),
            "exit" => Ok(CarEvent::Exit),
            _ => Err(format!("Event must be \"enter\" or \"exit\", got {}", s)),
        }
    }
}

/// Output record consumed by the storage/dashboard collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateRecord {
    /// Recognized plate text
    pub plate: String,

    /// Entry or exit
    pub event: CarEvent,

    /// OCR confidence of the plate text
    pub confidence: f32,

    /// Plate box as [x, y, w, h]
    #[serde(rename = "box")]
    pub bbox: [u32; 4],

    /// Vehicle box as [x, y, w, h]
    pub vehicle_box: Option<[u32; 4]>,

    /// Where the annotated diagnostic image was written
    pub image_path: Option<String>,

    /// ISO-8601 timestamp of the capture
    pub timestamp: String,
}

impl PlateRecord {
    pub fn from_plate(
        plate: &RecognizedPlate,
        event: CarEvent,
        image_path: Option<String>,
        timestamp: String,
    ) -> Self {
        Self {
            plate: plate.text.clone(),
            event,
            confidence: plate.confidence,
            bbox: plate.bbox.to_array(),
            vehicle_box: plate.vehicle_box.map(|b| b.to_array()),
            image_path,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_to_frame() {
        let bbox = BoundingBox::new(90, 40, 30, 20);
        let clipped = bbox.clip_to(100, 50).unwrap();
        assert_eq!(clipped, BoundingBox::new(90, 40, 10, 10));
        assert!(clipped.is_within(100, 50));

        // Entirely outside
        assert!(BoundingBox::new(120, 10, 5, 5).clip_to(100, 50).is_none());
        // Degenerate
        assert!(BoundingBox::new(10, 10, 0, 5).clip_to(100, 50).is_none());
    }

    #[test]
    fn test_from_corners_clamps_negative() {
        let bbox = BoundingBox::from_corners(-5.0, -2.5, 20.0, 10.0);
        assert_eq!(bbox.x, 0);
        assert_eq!(bbox.y, 0);
        assert_eq!(bbox.width, 20);
        assert_eq!(bbox.height, 10);
    }

    #[test]
    fn test_iou() {
        let box1 = BoundingBox::new(10, 10, 50, 20);
        let box2 = BoundingBox::new(30, 15, 50, 20);

        let iou = box1.iou(&box2);
        assert!(iou > 0.0 && iou < 1.0);

        // Identical boxes
        assert!((box1.iou(&box1) - 1.0).abs() < 0.001);

        // Non-overlapping boxes
        let box3 = BoundingBox::new(100, 100, 50, 20);
        assert_eq!(box1.iou(&box3), 0.0);
    }

    #[test]
    fn test_offset_by_parent() {
        let plate = BoundingBox::new(5, 7, 40, 10);
        let vehicle = BoundingBox::new(100, 200, 300, 150);
        assert_eq!(plate.offset_by(&vehicle), BoundingBox::new(105, 207, 40, 10));
    }

    #[test]
    fn test_label_from_class_name() {
        assert_eq!(
            DetectionLabel::from_class_name("truck"),
            Some(DetectionLabel::Vehicle(VehicleClass::Truck))
        );
        assert_eq!(
            DetectionLabel::from_class_name("License_Plate"),
            Some(DetectionLabel::PlateRegion)
        );
        assert_eq!(DetectionLabel::from_class_name("person"), None);
    }

    #[test]
    fn test_car_event_parsing() {
        assert_eq!("enter".parse::<CarEvent>().unwrap(), CarEvent::Enter);
        assert_eq!("EXIT".parse::<CarEvent>().unwrap(), CarEvent::Exit);
        assert!("park".parse::<CarEvent>().is_err());
    }

    #[test]
    fn test_plate_record_serialization() {
        let plate = RecognizedPlate {
            text: "ABC123".to_string(),
            confidence: 0.91,
            bbox: BoundingBox::new(120, 300, 90, 24),
            vehicle_box: None,
        };
        let record = PlateRecord::from_plate(
            &plate,
            CarEvent::Enter,
            Some("data/capture_20250101_120000.jpg".to_string()),
            "2025-01-01T12:00:00+00:00".to_string(),
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["plate"], "ABC123");
        assert_eq!(json["event"], "enter");
        assert_eq!(json["box"], serde_json::json!([120, 300, 90, 24]));
        assert!(json["vehicle_box"].is_null());

        let deserialized: PlateRecord = serde_json::from_value(json).unwrap();
        assert_eq!(deserialized, record);
    }
}
