//! CRNN/CTC plate text recognition backed by ONNX Runtime

use super::session::{self, ExecutionConfig};
use super::{OcrReading, TextRecognizer};
use crate::frame::Frame;
use anyhow::{Context, Result};
use image::GrayImage;
use imageproc::contrast::{equalize_histogram, otsu_level, threshold, ThresholdType};
use ndarray::{Array, IxDyn};
use ort::{session::Session, value::Value};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

const OUTPUT_NAMES: [&str; 3] = ["output", "output0", "logits"];

/// Preprocessed view of a plate crop handed to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrVariant {
    /// Plain grayscale
    Original,
    /// Binarised at the Otsu level
    Otsu,
    /// Histogram-equalised for low-contrast plates
    Equalized,
}

impl OcrVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrVariant::Original => "original",
            OcrVariant::Otsu => "otsu",
            OcrVariant::Equalized => "equalized",
        }
    }

    pub fn apply(&self, gray: &GrayImage) -> GrayImage {
        match self {
            OcrVariant::Original => gray.clone(),
            OcrVariant::Otsu => threshold(gray, otsu_level(gray), ThresholdType::Binary),
            OcrVariant::Equalized => equalize_histogram(gray),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrModelConfig {
    /// Path to the OCR ONNX model file
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// OCR model input width
    #[serde(default = "default_input_width")]
    pub input_width: u32,

    /// OCR model input height
    #[serde(default = "default_input_height")]
    pub input_height: u32,

    /// Character vocabulary; the CTC blank sits at index 0, so vocab starts at index 1
    #[serde(default = "default_char_vocab")]
    pub char_vocab: String,

    /// Model emits raw logits instead of probabilities
    #[serde(default)]
    pub output_is_logits: bool,

    /// Views of each crop that are read; the pipeline keeps the best valid one
    #[serde(default = "default_variants")]
    pub variants: Vec<OcrVariant>,
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/lpr_ocr.onnx")
}

fn default_input_width() -> u32 {
    200
}

fn default_input_height() -> u32 {
    64
}

fn default_char_vocab() -> String {
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ-".to_string()
}

fn default_variants() -> Vec<OcrVariant> {
    vec![OcrVariant::Original, OcrVariant::Otsu, OcrVariant::Equalized]
}

impl Default for OcrModelConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            input_width: default_input_width(),
            input_height: default_input_height(),
            char_vocab: default_char_vocab(),
            output_is_logits: false,
            variants: default_variants(),
        }
    }
}

pub struct OnnxTextRecognizer {
    config: OcrModelConfig,
    vocab: Vec<char>,
    session: Mutex<Session>,
    execution_provider: String,
}

impl OnnxTextRecognizer {
    pub fn load(config: OcrModelConfig, execution: &ExecutionConfig) -> Result<Self> {
        if config.variants.is_empty() {
            anyhow::bail!("At least one OCR variant must be configured");
        }
        let (session, execution_provider) = session::create_session(&config.model_path, execution)
            .context("Failed to load OCR model")?;

        tracing::info!(
            model = %config.model_path.display(),
            provider = %execution_provider,
            variants = ?config.variants,
            "initialized plate OCR model"
        );

        Ok(Self {
            vocab: config.char_vocab.chars().collect(),
            config,
            session: Mutex::new(session),
            execution_provider,
        })
    }

    /// Resize a grayscale view to the model input and convert to NCHW normalized to [0, 1]
    fn preprocess(&self, gray: &GrayImage) -> Array<f32, IxDyn> {
        let width = self.config.input_width;
        let height = self.config.input_height;
        let resized =
            image::imageops::resize(gray, width, height, image::imageops::FilterType::Triangle);

        let mut input = Array::zeros(IxDyn(&[1, 1, height as usize, width as usize]));
        for (x, y, pixel) in resized.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        }
        input
    }

    fn read_view(&self, gray: &GrayImage) -> Result<OcrReading> {
        let input_tensor = Value::from_array(self.preprocess(gray))?;

        let inference_start = Instant::now();
        let output = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| anyhow::anyhow!("Failed to lock OCR session: {}", e))?;
            let outputs = session.run(ort::inputs![input_tensor])?;
            let output_value = OUTPUT_NAMES
                .iter()
                .find_map(|name| outputs.get(*name))
                .with_context(|| {
                    format!("No OCR output tensor found (tried: {})", OUTPUT_NAMES.join(", "))
                })?;
            session::to_array(output_value)?
        };

        telemetry::metrics::LPR_INFERENCE_DURATION
            .with_label_values(&[self.id(), self.execution_provider.as_str()])
            .observe(inference_start.elapsed().as_secs_f64());

        ctc_greedy_decode(&output, &self.vocab, self.config.output_is_logits)
    }
}

impl TextRecognizer for OnnxTextRecognizer {
    fn id(&self) -> &str {
        "crnn_ocr"
    }

    fn recognize(&self, crop: &Frame) -> Result<OcrReading> {
        Ok(select_reading(self.recognize_variants(crop)?))
    }

    fn recognize_variants(&self, crop: &Frame) -> Result<Vec<OcrReading>> {
        let gray = image::imageops::grayscale(crop.pixels());
        self.config
            .variants
            .iter()
            .map(|variant| {
                self.read_view(&variant.apply(&gray))
                    .with_context(|| format!("OCR failed on {} view", variant.as_str()))
            })
            .collect()
    }
}

/// Longest non-empty reading, higher confidence breaking ties, earliest variant on a full tie
pub fn select_reading(readings: Vec<OcrReading>) -> OcrReading {
    readings
        .into_iter()
        .filter(|r| !r.is_empty())
        .fold(None, |best: Option<OcrReading>, reading| match best {
            Some(best)
                if (best.text.len(), best.confidence) >= (reading.text.len(), reading.confidence) =>
            {
                Some(best)
            }
            _ => Some(reading),
        })
        .unwrap_or_else(OcrReading::empty)
}

/// Greedy CTC decoding of `[1, T, vocab + 1]` scores.
///
/// Confidence is the mean of the winning probability over the emitted characters.
pub(crate) fn ctc_greedy_decode(
    output: &Array<f32, IxDyn>,
    vocab: &[char],
    output_is_logits: bool,
) -> Result<OcrReading> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[2] < 2 {
        anyhow::bail!("Unexpected OCR output shape {:?}", shape);
    }
    let sequence_length = shape[1];
    let classes = shape[2];

    let mut text = String::new();
    let mut probabilities = Vec::new();
    let mut prev_idx = 0; // CTC blank

    for t in 0..sequence_length {
        let mut scores: Vec<f32> = (0..classes).map(|c| output[[0, t, c]]).collect();
        if output_is_logits {
            softmax_in_place(&mut scores);
        }

        let (max_idx, max_prob) = scores
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (idx, p)| if p > best.1 { (idx, p) } else { best });

        // Skip blanks and repeats of the previous symbol
        if max_idx > 0 && max_idx != prev_idx {
            if let Some(&ch) = vocab.get(max_idx - 1) {
                text.push(ch);
                probabilities.push(max_prob.clamp(0.0, 1.0));
            }
        }
        prev_idx = max_idx;
    }

    if text.is_empty() {
        return Ok(OcrReading::empty());
    }

    let confidence = probabilities.iter().sum::<f32>() / probabilities.len() as f32;
    Ok(OcrReading::new(text, confidence))
}

fn softmax_in_place(scores: &mut [f32]) {
    let max = scores.iter().copied().fold(f32::MIN, f32::max);
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        for s in scores.iter_mut() {
            *s /= sum;
        }
    }
}
