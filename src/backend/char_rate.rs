//! # Character-Rate Backend
//!
//! Built-in backend that estimates word timings without a phoneme model:
//! each segment's time span is shared among its words in proportion to the
//! number of alignable characters they contain, snapped to the 20 ms frame
//! grid wav2vec2-style models emit, and clamped to the audio duration.
//!
//! ## Unaligned words:
//! Words with no alignable characters (pure punctuation, symbols) get no
//! timing of their own and are filled according to [`InterpolateMethod`].

use super::{AlignBackend, AlignMetadata, AlignRequest, LoadRequest, LoadedModel};
use crate::error::{AlignError, AlignResult};
use crate::languages;
use crate::types::{AlignmentResult, CharAlignment, InterpolateMethod, Segment, WordAlignment};
use tracing::{info, warn};

/// Language used when neither the caller nor the transcript names one.
const DEFAULT_LANGUAGE: &str = "en";

/// Frame stride of wav2vec2 emissions (320 samples at 16 kHz).
const FRAME_SECONDS: f64 = 0.02;

#[derive(Debug, Default)]
pub struct CharRateBackend;

impl CharRateBackend {
    pub fn new() -> Self {
        Self
    }
}

/// The "model" this backend loads: the language rules for tokenization.
#[derive(Debug)]
struct CharRateModel {
    language: String,
}

impl AlignBackend for CharRateBackend {
    fn name(&self) -> &'static str {
        "char-rate"
    }

    fn load_align_model(&self, request: &LoadRequest) -> AlignResult<LoadedModel> {
        let language = request
            .language_code
            .clone()
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let model_name = match &request.model_name {
            Some(name) => name.clone(),
            None => languages::default_align_model(&language)
                .ok_or_else(|| {
                    AlignError::model_load(format!(
                        "No default align-model for language: {}",
                        language
                    ))
                })?
                .to_string(),
        };

        if let Some(dir) = &request.model_dir {
            if !dir.is_dir() {
                return Err(AlignError::model_load(format!(
                    "Model directory not found: {}",
                    dir.display()
                )));
            }
        }

        Ok(LoadedModel {
            handle: Box::new(CharRateModel {
                language: language.clone(),
            }),
            metadata: AlignMetadata {
                language,
                model_name,
            },
        })
    }

    fn align(&self, request: AlignRequest<'_>) -> AlignResult<AlignmentResult> {
        let model = request
            .model
            .handle
            .downcast_ref::<CharRateModel>()
            .ok_or_else(|| AlignError::alignment("Model was not loaded by the char-rate backend"))?;
        let duration = request.audio.duration_seconds()?;

        let total = request.transcript.len();
        let mut segments = Vec::with_capacity(total);
        let mut word_segments = Vec::new();

        for (index, segment) in request.transcript.iter().enumerate() {
            if !(segment.start >= 0.0 && segment.end >= segment.start) {
                return Err(AlignError::alignment(format!(
                    "Segment {} has invalid timing {:.3}-{:.3}",
                    index, segment.start, segment.end
                )));
            }

            if request.print_progress {
                let percent = (index + 1) as f64 / total as f64 * 100.0;
                let percent = if request.combined_progress {
                    50.0 + percent / 2.0
                } else {
                    percent
                };
                info!("Progress: {:.2}%...", percent);
            }

            let end = match duration {
                Some(audio_end) if segment.start >= audio_end => {
                    warn!(
                        segment = index,
                        "Segment starts after the end of the audio, keeping original timing"
                    );
                    segments.push(segment.clone());
                    continue;
                }
                Some(audio_end) => segment.end.min(audio_end),
                None => segment.end,
            };

            let aligned = align_segment(segment, segment.start, end, &model.language, &request);
            if let Some(words) = &aligned.words {
                word_segments.extend(words.iter().cloned());
            }
            segments.push(aligned);
        }

        Ok(AlignmentResult {
            segments,
            word_segments,
            language: Some(model.language.clone()),
        })
    }
}

fn align_segment(
    segment: &Segment,
    start: f64,
    end: f64,
    language: &str,
    request: &AlignRequest<'_>,
) -> Segment {
    let words = split_words(&segment.text, language);
    let weights: Vec<usize> = words.iter().map(|w| alignable_chars(w)).collect();
    let total_weight: usize = weights.iter().sum();

    let mut timings: Vec<Option<(f64, f64)>> = vec![None; words.len()];
    if total_weight > 0 {
        let per_char = (end - start) / total_weight as f64;
        let mut cursor = start;
        for (slot, weight) in timings.iter_mut().zip(&weights) {
            if *weight == 0 {
                continue;
            }
            let word_end = cursor + per_char * *weight as f64;
            *slot = Some((snap(cursor, start, end), snap(word_end, start, end)));
            cursor = word_end;
        }
    }

    let timings = interpolate(&timings, start, end, request.interpolate_method);

    let aligned_words: Vec<WordAlignment> = words
        .iter()
        .zip(&timings)
        .map(|(word, timing)| WordAlignment {
            word: word.to_string(),
            start: timing.map(|(s, _)| round3(s)),
            end: timing.map(|(_, e)| round3(e)),
            score: None,
            speaker: segment.speaker.clone(),
        })
        .collect();

    let chars = if request.return_char_alignments {
        Some(char_alignments(&words, &timings, language))
    } else {
        None
    };

    let first = aligned_words.iter().find_map(|w| w.start);
    let last = aligned_words.iter().rev().find_map(|w| w.end);

    Segment {
        start: first.unwrap_or(segment.start),
        end: last.unwrap_or(segment.end),
        text: segment.text.clone(),
        speaker: segment.speaker.clone(),
        words: Some(aligned_words),
        chars,
    }
}

fn split_words<'t>(text: &'t str, language: &str) -> Vec<&'t str> {
    if languages::splits_on_characters(language) {
        text.char_indices()
            .filter(|(_, c)| !c.is_whitespace())
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect()
    } else {
        text.split_whitespace().collect()
    }
}

fn alignable_chars(word: &str) -> usize {
    word.chars().filter(|c| c.is_alphanumeric()).count()
}

/// Round to the frame grid, staying inside the segment.
fn snap(t: f64, start: f64, end: f64) -> f64 {
    ((t / FRAME_SECONDS).round() * FRAME_SECONDS).clamp(start, end)
}

fn round3(t: f64) -> f64 {
    (t * 1000.0).round() / 1000.0
}

fn interpolate(
    timings: &[Option<(f64, f64)>],
    start: f64,
    end: f64,
    method: InterpolateMethod,
) -> Vec<Option<(f64, f64)>> {
    match method {
        InterpolateMethod::Ignore => timings.to_vec(),
        InterpolateMethod::Nearest => (0..timings.len())
            .map(|i| timings[i].or_else(|| nearest_timed(timings, i)))
            .collect(),
        InterpolateMethod::Linear => {
            let mut filled = timings.to_vec();
            let mut i = 0;
            while i < filled.len() {
                if filled[i].is_some() {
                    i += 1;
                    continue;
                }
                let gap_start = i;
                while i < filled.len() && filled[i].is_none() {
                    i += 1;
                }
                let left = if gap_start == 0 {
                    start
                } else {
                    filled[gap_start - 1].map(|(_, e)| e).unwrap_or(start)
                };
                let right = filled.get(i).copied().flatten().map(|(s, _)| s).unwrap_or(end);
                let step = (right - left) / (i - gap_start) as f64;
                for (k, slot) in filled[gap_start..i].iter_mut().enumerate() {
                    let s = left + step * k as f64;
                    *slot = Some((s, s + step));
                }
            }
            filled
        }
    }
}

/// Closest aligned word by position; ties go to the earlier word.
fn nearest_timed(timings: &[Option<(f64, f64)>], index: usize) -> Option<(f64, f64)> {
    (1..timings.len()).find_map(|distance| {
        let before = index.checked_sub(distance).and_then(|j| timings[j]);
        let after = timings.get(index + distance).copied().flatten();
        before.or(after)
    })
}

fn char_alignments(
    words: &[&str],
    timings: &[Option<(f64, f64)>],
    language: &str,
) -> Vec<CharAlignment> {
    let spaced = !languages::splits_on_characters(language);
    let mut chars = Vec::new();

    for (index, (word, timing)) in words.iter().zip(timings).enumerate() {
        if spaced && index > 0 {
            chars.push(CharAlignment {
                char: " ".to_string(),
                start: None,
                end: None,
                score: None,
            });
        }

        let weight = alignable_chars(word);
        let mut cursor = timing.map(|(s, _)| s);
        let per_char = timing
            .filter(|_| weight > 0)
            .map(|(s, e)| (e - s) / weight as f64);

        for c in word.chars() {
            let span = match (cursor, per_char) {
                (Some(s), Some(step)) if c.is_alphanumeric() => {
                    cursor = Some(s + step);
                    Some((round3(s), round3(s + step)))
                }
                _ => None,
            };
            chars.push(CharAlignment {
                char: c.to_string(),
                start: span.map(|(s, _)| s),
                end: span.map(|(_, e)| e),
                score: None,
            });
        }
    }
    chars
}
