//! # Transcript Files
//!
//! Reading the transcripts alignment starts from, and writing aligned results.
//!
//! ## Formats:
//! - **Whisper JSON** (`.json`): `{"segments": [{"start", "end", "text"}], "language"}`
//! - **SRT** (`.srt`): numbered cues with `HH:MM:SS,mmm --> HH:MM:SS,mmm` timings;
//!   SRT carries no language
//!
//! Both formats can be written back out with [`write`].

use crate::error::{AlignError, AlignResult};
use crate::types::{AlignmentResult, Segment};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptFormat {
    Json,
    Srt,
}

impl TranscriptFormat {
    pub fn from_path(path: &Path) -> AlignResult<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => Ok(TranscriptFormat::Json),
            Some("srt") => Ok(TranscriptFormat::Srt),
            _ => Err(AlignError::invalid_input(format!(
                "Unsupported transcript format '{}', expected .json or .srt",
                path.display()
            ))),
        }
    }
}

/// Load a transcript, picking the format from the file extension.
pub fn load(path: &Path) -> AlignResult<AlignmentResult> {
    let format = TranscriptFormat::from_path(path)?;
    let data = fs::read_to_string(path).map_err(|e| {
        AlignError::invalid_input(format!("Cannot read transcript '{}': {}", path.display(), e))
    })?;

    match format {
        TranscriptFormat::Json => serde_json::from_str(&data).map_err(|e| {
            AlignError::invalid_input(format!("Invalid transcript JSON '{}': {}", path.display(), e))
        }),
        TranscriptFormat::Srt => parse_srt(&data),
    }
}

/// Parse SRT cues into segments. Cue numbers are optional.
pub fn parse_srt(data: &str) -> AlignResult<AlignmentResult> {
    let mut segments = Vec::new();

    for block in data.replace("\r\n", "\n").split("\n\n") {
        let mut lines = block.lines().map(str::trim).filter(|l| !l.is_empty());
        let Some(first) = lines.next() else {
            continue;
        };

        let timing = if first.contains("-->") {
            first
        } else {
            lines.next().ok_or_else(|| {
                AlignError::invalid_input(format!("SRT cue '{}' has no timing line", first))
            })?
        };

        let (start, end) = parse_srt_timing(timing)?;
        let text = lines.collect::<Vec<_>>().join(" ");
        segments.push(Segment::new(start, end, text));
    }

    Ok(AlignmentResult::new(segments, None))
}

fn parse_srt_timing(line: &str) -> AlignResult<(f64, f64)> {
    let (start, end) = line
        .split_once("-->")
        .ok_or_else(|| AlignError::invalid_input(format!("Invalid SRT timing: {}", line)))?;
    // cue settings may follow the end time
    let end = end.split_whitespace().next().unwrap_or_default();
    Ok((parse_srt_time(start.trim())?, parse_srt_time(end)?))
}

/// `HH:MM:SS,fff`, with `.` accepted for `,` and one to three fraction digits.
fn parse_srt_time(value: &str) -> AlignResult<f64> {
    let invalid = || AlignError::invalid_input(format!("Invalid SRT timestamp: {}", value));

    let (clock, fraction) = value.split_once([',', '.']).ok_or_else(invalid)?;
    let parts: Vec<&str> = clock.split(':').collect();
    let [h, m, s] = parts.as_slice() else {
        return Err(invalid());
    };
    if fraction.is_empty() || fraction.len() > 3 {
        return Err(invalid());
    }

    let field = |v: &str| v.parse::<u64>().map_err(|_| invalid());
    let (hours, minutes, secs) = (field(*h)?, field(*m)?, field(*s)?);
    let seconds = hours
        .checked_mul(3600)
        .and_then(|total| total.checked_add(minutes.checked_mul(60)?))
        .and_then(|total| total.checked_add(secs))
        .ok_or_else(invalid)?;
    // "5" is half a second, "05" five hundredths
    let scale = 10f64.powi(fraction.len() as i32);
    Ok(seconds as f64 + field(fraction)? as f64 / scale)
}

fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_ms / 3_600_000,
        (total_ms / 60_000) % 60,
        (total_ms / 1000) % 60,
        total_ms % 1000
    )
}

/// Render segments as SRT cues, prefixing the speaker when one is set.
pub fn to_srt(result: &AlignmentResult) -> String {
    let mut out = String::new();
    for (i, segment) in result.segments.iter().enumerate() {
        let text = match &segment.speaker {
            Some(speaker) => format!("[{}]: {}", speaker, segment.text.trim()),
            None => segment.text.trim().to_string(),
        };
        let _ = write!(
            out,
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_srt_time(segment.start),
            format_srt_time(segment.end),
            text
        );
    }
    out
}

/// Write `result` to `path` in the format its extension names, creating
/// parent directories as needed.
pub fn write(path: &Path, result: &AlignmentResult) -> AlignResult<()> {
    let format = TranscriptFormat::from_path(path)?;
    let io_err = |action: &str, e: std::io::Error| {
        AlignError::invalid_input(format!("Failed to {} '{}': {}", action, path.display(), e))
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io_err("create output directory for", e))?;
    }

    let mut file = File::create(path).map_err(|e| io_err("create", e))?;
    match format {
        TranscriptFormat::Json => {
            serde_json::to_writer_pretty(&mut file, result)
                .map_err(|e| AlignError::serialization("writing result JSON", e))?;
            file.write_all(b"\n").map_err(|e| io_err("finalize", e))?;
        }
        TranscriptFormat::Srt => {
            file.write_all(to_srt(result).as_bytes())
                .map_err(|e| io_err("write", e))?;
        }
    }
    Ok(())
}
