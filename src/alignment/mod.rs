//! Alignment orchestration: the per-run [`AlignmentUnit`] and the
//! [`AlignmentContainer`] that runs it in-process or in a worker.

mod container;
mod unit;

pub use container::{AlignmentContainer, ContainerState, ExecuteJob, ALIGNMENT_CACHE_KEY};
pub use unit::AlignmentUnit;
