//! # Alignment Data Model
//!
//! Plain, serializable value types that flow through the alignment core and
//! across the worker process boundary. Everything here is an owned, ordered
//! collection so a result can be written to the worker's stdout as-is.

use crate::device::DevicePreference;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Character-level timing, only produced when `return_char_alignments` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharAlignment {
    pub char: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// Word-level timing.
///
/// `start`/`end` are `None` for words the model could not align and that the
/// interpolation method left untouched (`ignore`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordAlignment {
    pub word: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

/// One transcript segment, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordAlignment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chars: Option<Vec<CharAlignment>>,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            speaker: None,
            words: None,
            chars: None,
        }
    }
}

/// A transcription or alignment result.
///
/// `language` is the language the transcription declared (or the alignment
/// model used); `None` means nothing was declared, e.g. a transcript loaded
/// from SRT.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlignmentResult {
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub word_segments: Vec<WordAlignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl AlignmentResult {
    pub fn new(segments: Vec<Segment>, language: Option<String>) -> Self {
        Self {
            segments,
            word_segments: Vec::new(),
            language,
        }
    }
}

/// How to assign timestamps to words the model could not align.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolateMethod {
    /// Borrow the timing of the closest aligned neighbour.
    #[default]
    Nearest,
    /// Place the word between its aligned neighbours.
    Linear,
    /// Leave the word without timestamps.
    Ignore,
}

impl std::str::FromStr for InterpolateMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nearest" => Ok(InterpolateMethod::Nearest),
            "linear" => Ok(InterpolateMethod::Linear),
            "ignore" => Ok(InterpolateMethod::Ignore),
            _ => Err(format!("Unknown interpolate method: {}", s)),
        }
    }
}

impl std::fmt::Display for InterpolateMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InterpolateMethod::Nearest => "nearest",
            InterpolateMethod::Linear => "linear",
            InterpolateMethod::Ignore => "ignore",
        };
        write!(f, "{}", name)
    }
}

/// Per-call options for an alignment run.
///
/// ## Defaults:
/// - no language code (the backend picks its default model)
/// - device from configuration
/// - `nearest` interpolation, no character alignments, no progress output
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlignOptions {
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub device: Option<DevicePreference>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
    #[serde(default)]
    pub interpolate_method: InterpolateMethod,
    #[serde(default)]
    pub return_char_alignments: bool,
    #[serde(default)]
    pub print_progress: bool,
    #[serde(default)]
    pub combined_progress: bool,
}
