//! # Error Handling
//!
//! Error types for the alignment core and the worker process boundary.
//!
//! ## Error Categories:
//! - **ModelLoad**: the backend could not resolve or load a model for a language
//! - **Alignment**: the backend's align call failed (bad segments, audio mismatch)
//! - **Pool**: the worker process failed to start, crashed mid-call or timed out
//! - **Serialization**: a value could not cross the process boundary
//! - **InvalidInput**: caller-supplied configuration or options are unusable
//!
//! ## Crossing the process boundary:
//! `AlignError` holds `std::io::Error` sources that cannot be serialized, so the
//! worker converts every failure into a [`WireError`] (kind + message) and the
//! parent rebuilds an `AlignError` of the same kind from it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by `AlignmentUnit`, `WorkerPool` and `AlignmentContainer`.
#[derive(Debug, Error)]
pub enum AlignError {
    /// Language or model could not be resolved, or the device is incompatible.
    #[error("model load error: {message}")]
    ModelLoad { message: String },

    /// The external align call failed.
    #[error("alignment error: {message}")]
    Alignment { message: String },

    /// Worker process failure: spawn, crash, I/O or apply timeout.
    #[error("worker pool error while {context}: {message}")]
    Pool {
        context: &'static str,
        message: String,
    },

    /// A value could not be encoded or decoded for the worker protocol.
    #[error("serialization error while {context}: {message}")]
    Serialization {
        context: &'static str,
        message: String,
    },

    /// Options or configuration rejected before any work started.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl AlignError {
    pub fn model_load(message: impl Into<String>) -> Self {
        Self::ModelLoad {
            message: message.into(),
        }
    }

    pub fn alignment(message: impl Into<String>) -> Self {
        Self::Alignment {
            message: message.into(),
        }
    }

    pub fn pool(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Pool {
            context,
            message: err.to_string(),
        }
    }

    pub fn serialization(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            context,
            message: err.to_string(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Machine-readable kind, stable across the worker protocol.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AlignError::ModelLoad { .. } => ErrorKind::ModelLoad,
            AlignError::Alignment { .. } => ErrorKind::Alignment,
            AlignError::Pool { .. } => ErrorKind::Pool,
            AlignError::Serialization { .. } => ErrorKind::Serialization,
            AlignError::InvalidInput { .. } => ErrorKind::InvalidInput,
        }
    }
}

/// Error kinds as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelLoad,
    Alignment,
    Pool,
    Serialization,
    InvalidInput,
}

/// Serializable form of an [`AlignError`] sent back by a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&AlignError> for WireError {
    fn from(err: &AlignError) -> Self {
        let message = match err {
            AlignError::ModelLoad { message }
            | AlignError::Alignment { message }
            | AlignError::InvalidInput { message } => message.clone(),
            AlignError::Pool { context, message }
            | AlignError::Serialization { context, message } => {
                format!("{} (in worker while {})", message, context)
            }
        };
        WireError {
            kind: err.kind(),
            message,
        }
    }
}

impl From<WireError> for AlignError {
    fn from(wire: WireError) -> Self {
        match wire.kind {
            ErrorKind::ModelLoad => AlignError::model_load(wire.message),
            ErrorKind::Alignment => AlignError::alignment(wire.message),
            ErrorKind::Pool => AlignError::pool("running job in worker", wire.message),
            ErrorKind::Serialization => {
                AlignError::serialization("running job in worker", wire.message)
            }
            ErrorKind::InvalidInput => AlignError::invalid_input(wire.message),
        }
    }
}

/// Shorthand for results using [`AlignError`].
pub type AlignResult<T> = Result<T, AlignError>;
