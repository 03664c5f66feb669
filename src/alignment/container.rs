//! # Alignment Container
//!
//! The entry point callers use. Decides whether an alignment runs in this
//! process or in a disposable worker process, and keeps one lazily created
//! [`AlignmentUnit`] per container.
//!
//! ## Execution Modes:
//! - **Daemon** (`enable_daemon_process = true`, the default): the first
//!   `run` creates a one-process [`WorkerPool`]. Each call acquires the
//!   worker, ships an [`ExecuteJob`] to it and releases it again. The worker
//!   exits after `auto_cleanup_timeout_seconds` without calls, taking every
//!   model allocation with it.
//! - **In-process**: `run` calls [`AlignmentContainer::execute`] directly.
//!
//! ## Transfer Representation:
//! A container holds things that cannot leave the process: the pool, the
//! loaded unit, the cache binding and the backend. [`ContainerState`] is what
//! crosses instead. [`AlignmentContainer::from_state`] rebuilds a container
//! from it with no pool and no unit, bound to the process-wide cache.

use super::unit::AlignmentUnit;
use crate::audio::AudioInput;
use crate::backend::AlignBackend;
use crate::cache::ModelCache;
use crate::error::{AlignError, AlignResult};
use crate::types::{AlignOptions, AlignmentResult};
use crate::worker::{PoolState, PoolStats, RemoteJob, WorkerCommand, WorkerPool, WorkerPoolConfig};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Cache key of the shared alignment unit.
pub const ALIGNMENT_CACHE_KEY: &str = "alignment";

/// The plain configuration of a container; the only part that is serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub enable_daemon_process: bool,
    pub auto_cleanup_timeout_seconds: u64,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ContainerState {
    fn default() -> Self {
        Self {
            enable_daemon_process: true,
            auto_cleanup_timeout_seconds: 60,
            auth_token: None,
        }
    }
}

/// One alignment call, as sent to a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteJob {
    pub container: ContainerState,
    pub audio: AudioInput,
    pub prior: AlignmentResult,
    pub options: AlignOptions,
}

impl RemoteJob for ExecuteJob {
    type Output = AlignmentResult;
    const NAME: &'static str = "align";
}

impl ExecuteJob {
    /// Run the job in this process, inside a container rebuilt from the
    /// transferred state.
    pub fn run(self, backend: Arc<dyn AlignBackend>) -> AlignResult<AlignmentResult> {
        AlignmentContainer::from_state(self.container, backend).execute(
            &self.audio,
            self.prior,
            &self.options,
        )
    }
}

pub struct AlignmentContainer {
    state: ContainerState,
    apply_timeout: Option<Duration>,
    worker: Option<WorkerCommand>,
    backend: Arc<dyn AlignBackend>,
    cache: Weak<ModelCache>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    model: OnceLock<Arc<AlignmentUnit>>,
}

impl AlignmentContainer {
    /// Create a container. Without a cache the unit is constructed directly
    /// on first use; with one it is shared under [`ALIGNMENT_CACHE_KEY`].
    pub fn new(
        state: ContainerState,
        backend: Arc<dyn AlignBackend>,
        cache: Option<&Arc<ModelCache>>,
    ) -> Self {
        Self {
            state,
            apply_timeout: None,
            worker: None,
            backend,
            cache: cache.map(Arc::downgrade).unwrap_or_default(),
            pool: Mutex::new(None),
            model: OnceLock::new(),
        }
    }

    /// Rebuild a container from its transfer representation.
    pub fn from_state(state: ContainerState, backend: Arc<dyn AlignBackend>) -> Self {
        Self::new(state, backend, Some(&ModelCache::global()))
    }

    /// Start workers with `command` instead of re-executing this binary.
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker = Some(command);
        self
    }

    /// Fail a worker call that takes longer than `limit`.
    pub fn with_apply_timeout(mut self, limit: Option<Duration>) -> Self {
        self.apply_timeout = limit;
        self
    }

    pub fn state(&self) -> ContainerState {
        self.state.clone()
    }

    /// The container's alignment unit, created on first call.
    pub fn get_model(&self) -> AlignResult<Arc<AlignmentUnit>> {
        if let Some(unit) = self.model.get() {
            return Ok(unit.clone());
        }

        let unit = match self.cache.upgrade() {
            Some(cache) => {
                debug!("Loading alignment unit from cache");
                cache
                    .get(ALIGNMENT_CACHE_KEY, AlignmentUnit::new)
                    .map_err(|e| AlignError::model_load(e.to_string()))?
            }
            None => {
                debug!("Creating alignment unit");
                Arc::new(AlignmentUnit::new())
            }
        };

        Ok(self.model.get_or_init(|| unit).clone())
    }

    /// Align in this process, whatever the daemon setting.
    pub fn execute(
        &self,
        audio: &AudioInput,
        prior: AlignmentResult,
        options: &AlignOptions,
    ) -> AlignResult<AlignmentResult> {
        self.get_model()?.run(
            self.backend.as_ref(),
            self.state.auth_token.as_deref(),
            audio,
            prior,
            options,
        )
    }

    /// Align `prior` against `audio`, in the worker process when daemon mode
    /// is enabled.
    ///
    /// In-process execution blocks the calling task until alignment is done.
    /// Errors are returned unchanged; the worker handle is released first.
    pub async fn run(
        &self,
        audio: AudioInput,
        prior: AlignmentResult,
        options: AlignOptions,
    ) -> AlignResult<AlignmentResult> {
        if !self.state.enable_daemon_process {
            return self.execute(&audio, prior, &options);
        }

        let pool = self.pool().await?;
        let job = ExecuteJob {
            container: self.state.clone(),
            audio,
            prior,
            options,
        };

        let mut handle = pool.acquire().await?;
        let result = pool.apply(&mut handle, &job).await;
        pool.release(handle);
        result
    }

    /// Shut the worker down if one was started. Safe to call repeatedly; a
    /// later `run` starts a new worker.
    pub async fn cleanup(&self) {
        let pool = self.pool.lock().await.clone();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
    }

    /// `None` until the first daemon-mode `run`.
    pub async fn pool_state(&self) -> Option<PoolState> {
        self.pool.lock().await.as_ref().map(|pool| pool.state())
    }

    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.lock().await.as_ref().map(|pool| pool.stats())
    }

    async fn pool(&self) -> AlignResult<Arc<WorkerPool>> {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }

        let command = match &self.worker {
            Some(command) => command.clone(),
            None => WorkerCommand::current_exe()?,
        };
        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                num_processes: 1,
                auto_cleanup_timeout: Duration::from_secs(self.state.auto_cleanup_timeout_seconds),
                apply_timeout: self.apply_timeout,
                ..WorkerPoolConfig::default()
            },
            command,
        )?);
        info!(
            "Created alignment context with auto cleanup timeout of {} seconds",
            self.state.auto_cleanup_timeout_seconds
        );

        *slot = Some(pool.clone());
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::types::Segment;

    fn in_process() -> ContainerState {
        ContainerState {
            enable_daemon_process: false,
            ..ContainerState::default()
        }
    }

    fn samples() -> AudioInput {
        AudioInput::Samples {
            sample_rate: 16000,
            samples: vec![0.0; 32000],
        }
    }

    fn prior() -> AlignmentResult {
        AlignmentResult::new(vec![Segment::new(0.0, 1.0, "hi")], Some("en".into()))
    }

    #[test]
    fn test_state_serializes_only_plain_fields() {
        let state = ContainerState {
            auth_token: Some("hf_token".into()),
            ..ContainerState::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(value["enable_daemon_process"], true);
        assert_eq!(value["auto_cleanup_timeout_seconds"], 60);
        assert_eq!(value["auth_token"], "hf_token");
    }

    #[tokio::test]
    async fn test_in_process_run_reuses_cached_unit() {
        let backend = Arc::new(FakeBackend::new("en"));
        let cache = Arc::new(ModelCache::new());
        let container = AlignmentContainer::new(in_process(), backend.clone(), Some(&cache));

        let first = container.run(samples(), prior(), AlignOptions::default()).await.unwrap();
        let second = container.run(samples(), prior(), AlignOptions::default()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.segments.len(), 1);
        assert!(cache.contains(ALIGNMENT_CACHE_KEY));
        assert_eq!(cache.len(), 1);
        assert_eq!(backend.loads(), vec!["en", "en"]);
        assert_eq!(backend.resident(), 0);
        assert_eq!(container.pool_state().await, None);
    }

    #[test]
    fn test_containers_sharing_a_cache_share_the_unit() {
        let backend: Arc<dyn AlignBackend> = Arc::new(FakeBackend::new("en"));
        let cache = Arc::new(ModelCache::new());
        let a = AlignmentContainer::new(in_process(), backend.clone(), Some(&cache));
        let b = AlignmentContainer::new(in_process(), backend, Some(&cache));

        assert!(Arc::ptr_eq(&a.get_model().unwrap(), &b.get_model().unwrap()));
    }

    #[test]
    fn test_shared_unit_runs_with_each_containers_backend() {
        let english = Arc::new(FakeBackend::new("en"));
        let german = Arc::new(FakeBackend::new("de"));
        let cache = Arc::new(ModelCache::new());
        let a = AlignmentContainer::new(in_process(), english.clone(), Some(&cache));
        let b = AlignmentContainer::new(
            ContainerState {
                auth_token: Some("tok".into()),
                ..in_process()
            },
            german.clone(),
            Some(&cache),
        );

        a.execute(&samples(), prior(), &AlignOptions::default()).unwrap();
        let undeclared = AlignmentResult::new(vec![Segment::new(0.0, 1.0, "hallo")], None);
        let result = b
            .execute(&samples(), undeclared, &AlignOptions::default())
            .unwrap();

        assert!(Arc::ptr_eq(&a.get_model().unwrap(), &b.get_model().unwrap()));
        assert_eq!(a.get_model().unwrap().runs(), 2);
        assert_eq!(english.loads(), vec!["en"]);
        assert_eq!(english.tokens(), vec![None]);
        assert_eq!(german.loads(), vec!["de"]);
        assert_eq!(german.tokens(), vec![Some("tok".to_string())]);
        assert_eq!(result.language.as_deref(), Some("de"));
    }

    #[test]
    fn test_without_cache_unit_is_created_once_per_container() {
        let backend: Arc<dyn AlignBackend> = Arc::new(FakeBackend::new("en"));
        let container = AlignmentContainer::new(in_process(), backend.clone(), None);
        let other = AlignmentContainer::new(in_process(), backend, None);

        let unit = container.get_model().unwrap();
        assert!(Arc::ptr_eq(&unit, &container.get_model().unwrap()));
        assert!(!Arc::ptr_eq(&unit, &other.get_model().unwrap()));
    }

    #[test]
    fn test_dropped_cache_falls_back_to_direct_construction() {
        let backend: Arc<dyn AlignBackend> = Arc::new(FakeBackend::new("en"));
        let cache = Arc::new(ModelCache::new());
        let container = AlignmentContainer::new(in_process(), backend, Some(&cache));
        drop(cache);

        assert!(container.get_model().is_ok());
    }

    #[test]
    fn test_execute_job_runs_in_rebuilt_container() {
        let backend = Arc::new(FakeBackend::new("en"));
        let job = ExecuteJob {
            container: ContainerState::default(),
            audio: samples(),
            prior: prior(),
            options: AlignOptions::default(),
        };

        let json = serde_json::to_string(&job).unwrap();
        let job: ExecuteJob = serde_json::from_str(&json).unwrap();
        let result = job.run(backend.clone()).unwrap();

        assert_eq!(result.segments.len(), 1);
        assert_eq!(backend.aligned_with(), vec!["en"]);
        assert!(ModelCache::global().contains(ALIGNMENT_CACHE_KEY));
    }

    #[tokio::test]
    async fn test_from_state_starts_without_pool_or_unit() {
        let backend: Arc<dyn AlignBackend> = Arc::new(FakeBackend::new("en"));
        let state = ContainerState {
            auto_cleanup_timeout_seconds: 5,
            ..ContainerState::default()
        };
        let container = AlignmentContainer::from_state(state.clone(), backend);

        assert_eq!(container.state(), state);
        assert!(container.model.get().is_none());
        assert_eq!(container.pool_state().await, None);
    }

    #[tokio::test]
    async fn test_cleanup_twice_without_pool() {
        let container = AlignmentContainer::new(
            ContainerState::default(),
            Arc::new(FakeBackend::new("en")),
            None,
        );
        container.cleanup().await;
        container.cleanup().await;
        assert_eq!(container.pool_state().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_crash_still_releases_handle() {
        let container = AlignmentContainer::new(
            ContainerState::default(),
            Arc::new(FakeBackend::new("en")),
            None,
        )
        .with_worker_command(WorkerCommand::new("sh").arg("-c").arg("read line; exit 3"));

        let err = container
            .run(samples(), prior(), AlignOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AlignError::Pool { .. }));

        let stats = container.pool_stats().await.unwrap();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(container.pool_state().await, Some(PoolState::Terminated));

        // the next call is not blocked and restarts the worker
        let err = container
            .run(samples(), prior(), AlignOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AlignError::Pool { .. }));
        let stats = container.pool_stats().await.unwrap();
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.released, 2);

        container.cleanup().await;
        container.cleanup().await;
    }
}
