//! # Alignment Unit
//!
//! Loads an alignment model for one run, aligns, and releases the model again.
//!
//! ## Run Sequence:
//! 1. Empty transcripts are returned unchanged without touching a model
//! 2. Load a model for the requested language (or the backend default)
//! 3. If the transcript declares a different language, drop that model and
//!    load one for the declared language instead
//! 4. Align
//! 5. Drop the model and reclaim device memory, on every exit path
//!
//! ## Resource Contract:
//! No model stays resident between runs. Step 5 is tied to a guard's `Drop`,
//! so an early `?` return from a failed load or align still releases.
//!
//! ## Sharing:
//! A unit holds no backend and no credentials. Containers that share one
//! through the [`crate::cache::ModelCache`] each pass their own backend and
//! auth token into [`AlignmentUnit::run`].

use crate::audio::AudioInput;
use crate::backend::{AlignBackend, AlignRequest, LoadRequest, LoadedModel};
use crate::device::{self, DevicePreference};
use crate::error::{AlignError, AlignResult};
use crate::types::{AlignOptions, AlignmentResult};
use candle_core::Device;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct AlignmentUnit {
    /// Runs started through this unit, empty transcripts included.
    runs: AtomicU64,
}

impl AlignmentUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Align `prior` against `audio` with models from `backend`.
    ///
    /// ## Errors:
    /// - **ModelLoad**: initial load or the language-switch reload failed
    /// - **Alignment**: the backend could not align the segments
    ///
    /// The model is released before any error reaches the caller.
    pub fn run(
        &self,
        backend: &dyn AlignBackend,
        auth_token: Option<&str>,
        audio: &AudioInput,
        prior: AlignmentResult,
        options: &AlignOptions,
    ) -> AlignResult<AlignmentResult> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if prior.segments.is_empty() {
            debug!("No segments to align, returning transcript unchanged");
            return Ok(prior);
        }

        let device = options.device.unwrap_or(DevicePreference::Auto).resolve();
        let request = LoadRequest {
            language_code: options.language_code.clone(),
            device: device.clone(),
            model_name: options.model_name.clone(),
            model_dir: options.model_dir.clone(),
            auth_token: auth_token.map(str::to_string),
        };

        let mut resident = ResidentModel::new(backend, &device);

        let switch_to = {
            let model = resident.load(&request)?;
            prior
                .language
                .as_ref()
                .filter(|declared| **declared != model.metadata.language)
                .cloned()
        };

        if let Some(language) = switch_to {
            info!(
                "New language found ({})! Loading alignment model for it",
                language
            );
            resident.load(&LoadRequest {
                language_code: Some(language),
                ..request
            })?;
        }

        let model = resident
            .model
            .as_ref()
            .ok_or_else(|| AlignError::model_load("No alignment model resident after load"))?;

        info!(
            segments = prior.segments.len(),
            language = %model.metadata.language,
            interpolate_method = %options.interpolate_method,
            "Performing alignment"
        );
        let start = Instant::now();

        let aligned = backend.align(AlignRequest {
            transcript: &prior.segments,
            model,
            audio,
            device: &device,
            interpolate_method: options.interpolate_method,
            return_char_alignments: options.return_char_alignments,
            print_progress: options.print_progress,
            combined_progress: options.combined_progress,
        })?;

        info!("Alignment finished in {:.2}s", start.elapsed().as_secs_f64());
        Ok(aligned)
    }
}

/// Owns the model for the duration of one run.
struct ResidentModel<'a> {
    backend: &'a dyn AlignBackend,
    device: &'a Device,
    model: Option<LoadedModel>,
}

impl<'a> ResidentModel<'a> {
    fn new(backend: &'a dyn AlignBackend, device: &'a Device) -> Self {
        Self {
            backend,
            device,
            model: None,
        }
    }

    /// Replace the resident model. The previous one is dropped first so two
    /// models never share the device.
    fn load(&mut self, request: &LoadRequest) -> AlignResult<&LoadedModel> {
        self.model = None;

        let start = Instant::now();
        let model = self.backend.load_align_model(request)?;
        info!(
            backend = self.backend.name(),
            language = %model.metadata.language,
            model = %model.metadata.model_name,
            device = device::label(self.device),
            "Loaded alignment model in {:.2}s",
            start.elapsed().as_secs_f64()
        );
        Ok(self.model.insert(model))
    }
}

impl Drop for ResidentModel<'_> {
    fn drop(&mut self) {
        if let Some(model) = self.model.take() {
            debug!(language = %model.metadata.language, "Unloading alignment model");
        }
        self.backend.reclaim_memory(self.device);
    }
}
