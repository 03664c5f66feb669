//! # Audio Input
//!
//! Audio handed to an alignment run. Either a file path (read by the backend
//! inside whichever process runs the job) or decoded samples.

use crate::error::{AlignError, AlignResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Audio handed to [`crate::alignment::AlignmentUnit::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioInput {
    /// Path to an audio file, resolved in the process that runs the job.
    File { path: PathBuf },
    /// Mono samples in `[-1.0, 1.0]`.
    Samples { sample_rate: u32, samples: Vec<f32> },
}

impl AudioInput {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        AudioInput::File { path: path.into() }
    }

    /// Duration in seconds, when it can be determined.
    ///
    /// ## Returns:
    /// - **Ok(Some(secs))**: in-memory samples, or a readable WAV file
    /// - **Ok(None)**: a non-WAV file; the caller keeps transcript timings as-is
    /// - **Err(Alignment)**: the file is missing or the WAV data is corrupt
    pub fn duration_seconds(&self) -> AlignResult<Option<f64>> {
        match self {
            AudioInput::Samples {
                sample_rate,
                samples,
            } => {
                if *sample_rate == 0 {
                    return Err(AlignError::alignment("Audio sample rate must be greater than 0"));
                }
                Ok(Some(samples.len() as f64 / *sample_rate as f64))
            }
            AudioInput::File { path } => {
                if !path.is_file() {
                    return Err(AlignError::alignment(format!(
                        "Audio file not found: {}",
                        path.display()
                    )));
                }
                if is_wav(path) {
                    wav_duration(path).map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

fn wav_duration(path: &Path) -> AlignResult<f64> {
    let mut file = File::open(path)
        .map_err(|e| AlignError::alignment(format!("Cannot open {}: {}", path.display(), e)))?;
    let (header, data) = wav::read(&mut file)
        .map_err(|e| AlignError::alignment(format!("Invalid WAV file {}: {}", path.display(), e)))?;

    let sample_count = match &data {
        wav::BitDepth::Eight(v) => v.len(),
        wav::BitDepth::Sixteen(v) => v.len(),
        wav::BitDepth::TwentyFour(v) => v.len(),
        wav::BitDepth::ThirtyTwoFloat(v) => v.len(),
        wav::BitDepth::Empty => 0,
    };

    let frames_per_second = header.sampling_rate as f64 * header.channel_count.max(1) as f64;
    if frames_per_second == 0.0 {
        return Err(AlignError::alignment(format!(
            "WAV file {} declares a sample rate of 0",
            path.display()
        )));
    }
    Ok(sample_count as f64 / frames_per_second)
}
