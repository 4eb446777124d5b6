use thiserror::Error;

/// Run-fatal failures. Anything else that goes wrong inside a run only shrinks the result set.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("image source {target} unavailable after {attempts} attempt(s): {reason}")]
    SourceUnavailable {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("image from {source_id} could not be decoded: {reason}")]
    DecodeError { source_id: String, reason: String },

    #[error("{capability} capability failed: {reason}")]
    DetectionUnavailable { capability: String, reason: String },
}

impl PipelineError {
    pub fn source_unavailable(target: impl Into<String>, attempts: u32, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            target: target.into(),
            attempts,
            reason: reason.into(),
        }
    }

    pub fn decode(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DecodeError {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a capability failure, keeping the full context chain as the reason
    pub fn detection_unavailable(capability: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::DetectionUnavailable {
            capability: capability.into(),
            reason: format!("{:#}", err),
        }
    }

    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable { .. } => "source_unavailable",
            PipelineError::DecodeError { .. } => "decode_error",
            PipelineError::DetectionUnavailable { .. } => "detection_unavailable",
        }
    }
}

/// Why a plate candidate was dropped
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("text {text:?} shorter than {min} characters")]
    TooShort { text: String, min: usize },

    #[error("text {text:?} longer than {max} characters")]
    TooLong { text: String, max: usize },

    #[error("confidence {confidence:.3} below threshold {threshold:.3}")]
    LowConfidence { confidence: f32, threshold: f32 },

    #[error("text {text:?} needs at least one letter and one digit")]
    MissingLetterOrDigit { text: String },

    #[error("text {text:?} matches no configured plate pattern")]
    PatternMismatch { text: String },

    #[error("text {text:?} is only {ratio:.2} alphanumeric, below {min:.2}")]
    Garbled { text: String, ratio: f32, min: f32 },
}

impl Rejection {
    /// Metric label for the rejection reason
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::TooShort { .. } => "too_short",
            Rejection::TooLong { .. } => "too_long",
            Rejection::LowConfidence { .. } => "low_confidence",
            Rejection::MissingLetterOrDigit { .. } => "missing_letter_or_digit",
            Rejection::PatternMismatch { .. } => "pattern_mismatch",
            Rejection::Garbled { .. } => "garbled",
        }
    }
}
