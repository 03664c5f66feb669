//! Process isolation: a single disposable worker process driven over
//! newline-delimited JSON on its stdin/stdout.
//!
//! - [`WorkerPool`] is the parent side
//! - [`serve`] is the loop the worker process runs

mod pool;
mod protocol;
mod serve;

pub use pool::{PoolHandle, PoolState, PoolStats, WorkerCommand, WorkerPool, WorkerPoolConfig};
pub use protocol::{decode_line, encode_line, RemoteJob, Request, Response};
pub use serve::serve;
