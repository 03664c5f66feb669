//! Resource-accounting backend for unit tests.
//!
//! Every model it hands out increments a shared "resident" counter that only
//! goes back down when the model is dropped, so tests can assert that no
//! model outlives a run.

use super::{AlignBackend, AlignMetadata, AlignRequest, LoadRequest, LoadedModel};
use crate::error::{AlignError, AlignResult};
use crate::types::{AlignmentResult, Segment};
use candle_core::Device;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) struct FakeBackend {
    pub default_language: String,
    /// Languages whose load fails.
    pub unloadable: Vec<String>,
    pub fail_align: bool,
    pub loads: Mutex<Vec<String>>,
    /// Auth token of every load request.
    pub tokens: Mutex<Vec<Option<String>>>,
    pub aligned_with: Mutex<Vec<String>>,
    pub resident: Arc<AtomicUsize>,
    pub reclaims: AtomicUsize,
}

struct FakeModel {
    resident: Arc<AtomicUsize>,
}

impl Drop for FakeModel {
    fn drop(&mut self) {
        self.resident.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeBackend {
    pub fn new(default_language: &str) -> Self {
        Self {
            default_language: default_language.to_string(),
            unloadable: Vec::new(),
            fail_align: false,
            loads: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            aligned_with: Mutex::new(Vec::new()),
            resident: Arc::new(AtomicUsize::new(0)),
            reclaims: AtomicUsize::new(0),
        }
    }

    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn aligned_with(&self) -> Vec<String> {
        self.aligned_with.lock().unwrap().clone()
    }

    pub fn resident(&self) -> usize {
        self.resident.load(Ordering::SeqCst)
    }

    pub fn reclaims(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }
}

impl AlignBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn load_align_model(&self, request: &LoadRequest) -> AlignResult<LoadedModel> {
        let language = request
            .language_code
            .clone()
            .unwrap_or_else(|| self.default_language.clone());
        self.loads.lock().unwrap().push(language.clone());
        self.tokens.lock().unwrap().push(request.auth_token.clone());

        if self.unloadable.contains(&language) {
            return Err(AlignError::model_load(format!(
                "No default align-model for language: {}",
                language
            )));
        }

        self.resident.fetch_add(1, Ordering::SeqCst);
        Ok(LoadedModel {
            handle: Box::new(FakeModel {
                resident: self.resident.clone(),
            }),
            metadata: AlignMetadata {
                model_name: format!("fake-{}", language),
                language,
            },
        })
    }

    fn align(&self, request: AlignRequest<'_>) -> AlignResult<AlignmentResult> {
        let language = request.model.metadata.language.clone();
        self.aligned_with.lock().unwrap().push(language.clone());

        if self.fail_align {
            return Err(AlignError::alignment("audio does not match transcript"));
        }

        let segments = request
            .transcript
            .iter()
            .map(|s| Segment {
                start: s.start + 0.1,
                end: s.end - 0.1,
                ..s.clone()
            })
            .collect();
        Ok(AlignmentResult::new(segments, Some(language)))
    }

    fn reclaim_memory(&self, _device: &Device) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}
