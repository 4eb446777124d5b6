//! Input validation for configuration values and externally supplied names
//!
//! Everything that flows in from the environment, a pipeline config file or a
//! command line argument is checked here before it reaches the pipeline:
//! - thresholds and ratios must be finite and inside their interval
//! - URLs must be bounded and free of shell metacharacters
//! - output file names must not escape the output directory

use anyhow::{anyhow, Result};
use std::path::{Component, Path, PathBuf};

// ============================================================================
// CONSTANTS: Input Size Limits
// ============================================================================

/// Maximum length for URLs (camera base URL, event sink URL)
pub const MAX_URI_LENGTH: usize = 4096;

/// Maximum length for file paths
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum length for a single file name component
pub const MAX_FILE_NAME_LENGTH: usize = 255;

/// Maximum length for a plate pattern
pub const MAX_PATTERN_LENGTH: usize = 32;

// ============================================================================
// String Validation
// ============================================================================

/// Validate string length against a maximum
pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

/// Validate non-empty string
pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

/// Validate an HTTP URL (camera, event sink)
pub fn validate_uri(uri: &str, field_name: &str) -> Result<()> {
    validate_non_empty(uri, field_name)?;
    validate_length(uri, MAX_URI_LENGTH, field_name)?;

    let dangerous_chars = ['`', '$', ';', '|', '&', '\n', '\r'];
    if uri.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!(
            "{} contains dangerous shell metacharacters",
            field_name
        ));
    }

    if !(uri.starts_with("http://") || uri.starts_with("https://")) {
        return Err(anyhow!(
            "{} must start with http:// or https:// (got {})",
            field_name,
            uri
        ));
    }

    Ok(())
}

/// Validate a plate pattern made of `L` (letter), `D` (digit) and `A` (either)
pub fn validate_plate_pattern(pattern: &str) -> Result<()> {
    validate_non_empty(pattern, "plate pattern")?;
    validate_length(pattern, MAX_PATTERN_LENGTH, "plate pattern")?;

    if let Some(bad) = pattern.chars().find(|c| !matches!(c, 'L' | 'D' | 'A')) {
        return Err(anyhow!(
            "plate pattern {:?} contains {:?}; only L, D and A are allowed",
            pattern,
            bad
        ));
    }
    Ok(())
}

// ============================================================================
// Path Validation (Prevent Path Traversal)
// ============================================================================

/// Validate file path without requiring it to exist (for new files)
pub fn validate_path_components(
    path: &Path,
    base_dir: Option<&Path>,
    field_name: &str,
) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("{} contains invalid UTF-8", field_name))?;

    validate_length(path_str, MAX_PATH_LENGTH, field_name)?;

    for component in path.components() {
        if component == Component::ParentDir {
            return Err(anyhow!(
                "{} contains '..' component (path traversal attempt)",
                field_name
            ));
        }
    }

    if let Some(base) = base_dir {
        if path.is_absolute() {
            return Err(anyhow!("{} attempts to escape base directory", field_name));
        }
        Ok(base.join(path))
    } else {
        Ok(path.to_path_buf())
    }
}

/// Validate a bare file name (no directories) for files written into the output directory
pub fn validate_file_name(name: &str, field_name: &str) -> Result<()> {
    validate_non_empty(name, field_name)?;
    validate_length(name, MAX_FILE_NAME_LENGTH, field_name)?;

    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(anyhow!(
            "{} contains invalid characters (no path separators or '..' allowed)",
            field_name
        ));
    }
    Ok(())
}

// ============================================================================
// Numeric Validation
// ============================================================================

/// Validate positive duration
pub fn validate_duration_ms(ms: u64, field_name: &str) -> Result<()> {
    if ms == 0 {
        return Err(anyhow!("{} must be greater than 0", field_name));
    }
    Ok(())
}

/// Validate value is within range
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field_name: &str,
) -> Result<()> {
    if value < min || value > max {
        return Err(anyhow!(
            "{} must be between {} and {}, got {}",
            field_name,
            min,
            max,
            value
        ));
    }
    Ok(())
}

/// Validate a threshold or ratio in [0, 1]. NaN is rejected.
pub fn validate_unit_interval(value: f32, field_name: &str) -> Result<()> {
    if !value.is_finite() {
        return Err(anyhow!("{} must be a finite number, got {}", field_name, value));
    }
    validate_range(value, 0.0, 1.0, field_name)
}

// ============================================================================
// Tests
// ============================================================================
