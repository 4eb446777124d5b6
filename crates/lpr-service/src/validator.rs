//! Plate text normalisation and validation.
//!
//! Rules are data (`ValidationRules`) so regional plate formats and OCR
//! confusion tables can be supplied through configuration.

use crate::error::Rejection;
use anyhow::Result;
use common::validation::{validate_plate_pattern, validate_unit_interval};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lookalike substitutions applied only where a pattern demands the other character class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionTable {
    /// Replacement letters for digits found where a letter is expected
    #[serde(default = "default_digit_to_letter")]
    pub digit_to_letter: BTreeMap<char, char>,

    /// Replacement digits for letters found where a digit is expected
    #[serde(default = "default_letter_to_digit")]
    pub letter_to_digit: BTreeMap<char, char>,
}

fn default_digit_to_letter() -> BTreeMap<char, char> {
    [
        ('0', 'O'),
        ('1', 'I'),
        ('2', 'Z'),
        ('4', 'A'),
        ('5', 'S'),
        ('6', 'G'),
        ('7', 'T'),
        ('8', 'B'),
    ]
    .into_iter()
    .collect()
}

fn default_letter_to_digit() -> BTreeMap<char, char> {
    [
        ('O', '0'),
        ('Q', '0'),
        ('D', '0'),
        ('I', '1'),
        ('L', '1'),
        ('Z', '2'),
        ('S', '5'),
        ('G', '6'),
        ('B', '8'),
        ('T', '7'),
        ('A', '4'),
    ]
    .into_iter()
    .collect()
}

impl Default for ConfusionTable {
    fn default() -> Self {
        Self {
            digit_to_letter: default_digit_to_letter(),
            letter_to_digit: default_letter_to_digit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    /// Minimum plate length after normalisation
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Maximum plate length after normalisation
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Require at least one letter and one digit
    #[serde(default = "default_require_letter_and_digit")]
    pub require_letter_and_digit: bool,

    /// Share of alphanumerics among the non-whitespace raw characters below which a read is noise
    #[serde(default = "default_min_alnum_ratio")]
    pub min_alnum_ratio: f32,

    /// Accepted formats over `L` (letter), `D` (digit), `A` (either); empty accepts any layout
    #[serde(default)]
    pub patterns: Vec<String>,

    #[serde(default)]
    pub confusions: ConfusionTable,
}

fn default_min_length() -> usize {
    5
}

fn default_max_length() -> usize {
    12
}

fn default_require_letter_and_digit() -> bool {
    true
}

fn default_min_alnum_ratio() -> f32 {
    0.8
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            max_length: default_max_length(),
            require_letter_and_digit: default_require_letter_and_digit(),
            min_alnum_ratio: default_min_alnum_ratio(),
            patterns: Vec::new(),
            confusions: ConfusionTable::default(),
        }
    }
}

impl ValidationRules {
    pub fn validate(&self) -> Result<()> {
        if self.min_length == 0 {
            anyhow::bail!("min_length must be greater than 0");
        }
        if self.max_length < self.min_length {
            anyhow::bail!(
                "max_length ({}) must be >= min_length ({})",
                self.max_length,
                self.min_length
            );
        }
        validate_unit_interval(self.min_alnum_ratio, "min_alnum_ratio")?;
        for pattern in &self.patterns {
            validate_plate_pattern(pattern)?;
        }
        for (from, to) in &self.confusions.digit_to_letter {
            if !from.is_ascii_digit() || !to.is_ascii_uppercase() {
                anyhow::bail!("digit_to_letter entry {:?} -> {:?} is not digit -> letter", from, to);
            }
        }
        for (from, to) in &self.confusions.letter_to_digit {
            if !from.is_ascii_uppercase() || !to.is_ascii_digit() {
                anyhow::bail!("letter_to_digit entry {:?} -> {:?} is not letter -> digit", from, to);
            }
        }
        Ok(())
    }
}

/// Normalises raw OCR text and accepts or rejects it
#[derive(Debug, Clone)]
pub struct PlateValidator {
    rules: ValidationRules,
    confidence_threshold: f32,
}

impl PlateValidator {
    pub fn new(rules: ValidationRules, confidence_threshold: f32) -> Self {
        Self {
            rules,
            confidence_threshold,
        }
    }

    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    /// Validated plate text, or the reason the read was dropped
    pub fn validate(&self, raw_text: &str, ocr_confidence: f32) -> Result<String, Rejection> {
        if let Some(ratio) = alnum_ratio(raw_text) {
            if ratio < self.rules.min_alnum_ratio {
                return Err(Rejection::Garbled {
                    text: raw_text.to_string(),
                    ratio,
                    min: self.rules.min_alnum_ratio,
                });
            }
        }

        let text = normalize(raw_text);

        if text.len() < self.rules.min_length {
            return Err(Rejection::TooShort {
                text,
                min: self.rules.min_length,
            });
        }
        if text.len() > self.rules.max_length {
            return Err(Rejection::TooLong {
                text,
                max: self.rules.max_length,
            });
        }
        if ocr_confidence.is_nan() || ocr_confidence < self.confidence_threshold {
            return Err(Rejection::LowConfidence {
                confidence: ocr_confidence,
                threshold: self.confidence_threshold,
            });
        }

        let text = self.apply_patterns(text)?;

        if self.rules.require_letter_and_digit {
            let has_letter = text.chars().any(|c| c.is_ascii_alphabetic());
            let has_digit = text.chars().any(|c| c.is_ascii_digit());
            if !(has_letter && has_digit) {
                return Err(Rejection::MissingLetterOrDigit { text });
            }
        }

        Ok(text)
    }

    fn apply_patterns(&self, text: String) -> Result<String, Rejection> {
        if self.rules.patterns.is_empty() {
            return Ok(text);
        }
        if self.rules.patterns.iter().any(|p| matches_pattern(&text, p)) {
            return Ok(text);
        }
        self.rules
            .patterns
            .iter()
            .find_map(|p| correct_to_pattern(&text, p, &self.rules.confusions))
            .ok_or(Rejection::PatternMismatch { text })
    }
}

/// Drop separators and anything non-alphanumeric, then uppercase
pub fn normalize(raw_text: &str) -> String {
    raw_text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Alphanumeric share of the non-whitespace characters, `None` when there are none
fn alnum_ratio(raw_text: &str) -> Option<f32> {
    let (total, alnum) = raw_text
        .chars()
        .filter(|c| !c.is_whitespace())
        .fold((0usize, 0usize), |(total, alnum), c| {
            (total + 1, alnum + usize::from(c.is_alphanumeric()))
        });
    (total > 0).then(|| alnum as f32 / total as f32)
}

fn fits(c: char, slot: char) -> bool {
    match slot {
        'L' => c.is_ascii_alphabetic(),
        'D' => c.is_ascii_digit(),
        _ => c.is_ascii_alphanumeric(),
    }
}

fn matches_pattern(text: &str, pattern: &str) -> bool {
    text.len() == pattern.len() && text.chars().zip(pattern.chars()).all(|(c, s)| fits(c, s))
}

/// Replace only characters the pattern cannot accept, using the confusion table
fn correct_to_pattern(text: &str, pattern: &str, table: &ConfusionTable) -> Option<String> {
    if text.len() != pattern.len() {
        return None;
    }
    text.chars()
        .zip(pattern.chars())
        .map(|(c, slot)| {
            if fits(c, slot) {
                Some(c)
            } else if slot == 'L' {
                table.digit_to_letter.get(&c).copied()
            } else {
                table.letter_to_digit.get(&c).copied()
            }
        })
        .collect()
}
