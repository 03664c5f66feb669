//! # Alignment Backends
//!
//! The seam between the resource-management core and whatever actually
//! aligns text to audio. The core never looks inside a model: it loads one,
//! hands it back to the backend for `align`, then drops it.
//!
//! ## Contract:
//! - `load_align_model` may allocate device memory; the returned
//!   [`LoadedModel`] owns it and releases it on drop.
//! - `align` must not retain the model beyond the call.
//! - `reclaim_memory` is called after every run, once the model is dropped.
//!
//! ## Implementations:
//! - [`CharRateBackend`]: built-in, used by the CLI worker
//! - a resource-accounting fake for unit tests

mod char_rate;
#[cfg(test)]
pub(crate) mod fake;

pub use char_rate::CharRateBackend;

use crate::audio::AudioInput;
use crate::error::AlignResult;
use crate::types::{AlignmentResult, InterpolateMethod, Segment};
use candle_core::Device;
use std::any::Any;
use std::path::PathBuf;

/// Parameters for [`AlignBackend::load_align_model`].
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// `None` lets the backend pick its default language.
    pub language_code: Option<String>,
    pub device: Device,
    pub model_name: Option<String>,
    pub model_dir: Option<PathBuf>,
    pub auth_token: Option<String>,
}

/// What a backend reports about a model it loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignMetadata {
    pub language: String,
    pub model_name: String,
}

/// A loaded model. Dropping it releases everything the backend allocated.
pub struct LoadedModel {
    pub handle: Box<dyn Any + Send>,
    pub metadata: AlignMetadata,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Parameters for [`AlignBackend::align`].
#[derive(Debug, Clone, Copy)]
pub struct AlignRequest<'a> {
    pub transcript: &'a [Segment],
    pub model: &'a LoadedModel,
    pub audio: &'a AudioInput,
    pub device: &'a Device,
    pub interpolate_method: InterpolateMethod,
    pub return_char_alignments: bool,
    pub print_progress: bool,
    pub combined_progress: bool,
}

pub trait AlignBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Load an alignment model. Fails with `ModelLoad` when the language or
    /// model cannot be resolved.
    fn load_align_model(&self, request: &LoadRequest) -> AlignResult<LoadedModel>;

    /// Align `request.transcript` against `request.audio`. Fails with
    /// `Alignment` on malformed segments or unusable audio.
    fn align(&self, request: AlignRequest<'_>) -> AlignResult<AlignmentResult>;

    /// Release cached device memory after a model was dropped.
    fn reclaim_memory(&self, device: &Device) {
        crate::device::reclaim_memory(device);
    }
}
