//! # speech-align
//!
//! Refines transcript timestamps against audio while keeping alignment
//! models off the GPU whenever they are not in use.
//!
//! ## Architecture:
//! - **alignment**: [`AlignmentContainer`] (in-process or worker execution)
//!   and [`AlignmentUnit`] (load, align, release for one run)
//! - **worker**: the one-process [`WorkerPool`] and the worker-side `serve` loop
//! - **cache**: the process-wide [`ModelCache`]
//! - **backend**: the [`AlignBackend`] trait and the built-in [`CharRateBackend`]
//! - **config**, **device**, **audio**, **languages**, **transcript**: supporting pieces
//!
//! ## Example:
//! ```no_run
//! use speech_align::{AlignOptions, AlignmentContainer, AudioInput, CharRateBackend, ContainerState};
//! use std::sync::Arc;
//!
//! # async fn demo() -> speech_align::AlignResult<()> {
//! let container = AlignmentContainer::new(
//!     ContainerState::default(),
//!     Arc::new(CharRateBackend::new()),
//!     None,
//! );
//! let prior = speech_align::transcript::load("talk.json".as_ref())?;
//! let aligned = container
//!     .run(AudioInput::file("talk.wav"), prior, AlignOptions::default())
//!     .await?;
//! container.cleanup().await;
//! # Ok(())
//! # }
//! ```

pub mod alignment;
pub mod audio;
pub mod backend;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod languages;
pub mod transcript;
pub mod types;
pub mod worker;

pub use alignment::{AlignmentContainer, AlignmentUnit, ContainerState, ExecuteJob};
pub use audio::AudioInput;
pub use backend::{AlignBackend, CharRateBackend};
pub use cache::ModelCache;
pub use device::DevicePreference;
pub use error::{AlignError, AlignResult};
pub use types::{AlignOptions, AlignmentResult, InterpolateMethod, Segment};
pub use worker::{PoolState, WorkerCommand, WorkerPool};
