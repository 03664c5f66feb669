//! Wire format between a [`super::WorkerPool`] and its worker process.
//!
//! One JSON document per line. The parent writes a [`Request`] to the
//! worker's stdin and reads exactly one [`Response`] with the same `id` from
//! its stdout. Logs go to stderr, never stdout.

use crate::error::{AlignError, AlignResult, WireError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work that can be shipped to a worker process by value.
///
/// The job type itself is the "callable": the worker decodes it and runs the
/// handler registered for it, so everything the job needs must be inside it.
pub trait RemoteJob: Serialize + DeserializeOwned + Send + Sync {
    type Output: Serialize + DeserializeOwned + Send;

    /// Short name for logs.
    const NAME: &'static str;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Request<J> {
    pub id: Uuid,
    pub job: J,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response<T> {
    pub id: Uuid,
    pub outcome: Result<T, WireError>,
}

/// Just the id of a request, for replying to one whose job did not decode.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub id: Uuid,
}

/// Encode `value` as a single protocol line, newline included.
pub fn encode_line<T: Serialize>(value: &T, context: &'static str) -> AlignResult<String> {
    let mut line =
        serde_json::to_string(value).map_err(|e| AlignError::serialization(context, e))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str, context: &'static str) -> AlignResult<T> {
    serde_json::from_str(line.trim_end()).map_err(|e| AlignError::serialization(context, e))
}
