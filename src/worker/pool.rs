//! # Worker Pool
//!
//! Runs jobs in a disposable child process so that everything the job
//! allocated (including GPU memory held by native libraries) is returned to
//! the OS when the process exits.
//!
//! ## Lifecycle:
//! ```text
//! Uncreated --acquire--> Running --apply--> IdleTimeoutPending
//!     IdleTimeoutPending --acquire--> Running
//!     IdleTimeoutPending --idle timeout / shutdown--> Terminated
//!     Running --worker crash / apply timeout--> Terminated
//!     Terminated --acquire--> Running (new process)
//! ```
//!
//! ## Exclusive use:
//! The pool holds exactly one worker. [`WorkerPool::acquire`] hands out a
//! [`PoolHandle`] that owns the worker slot's lock; a second caller waits
//! until the first handle is released (explicitly or by drop). Replies are
//! therefore always read by the caller that sent the request.
//!
//! ## Reply size:
//! A reply line longer than [`WorkerPoolConfig::max_reply_bytes`] is not
//! buffered further. The call fails with `Serialization` and the worker is
//! torn down, since the rest of the oversized line is still in the pipe.
//!
//! ## Idle teardown:
//! Every completed `apply` arms a timer task. If nobody acquires the worker
//! before it fires, the task terminates the process. The task needs the slot
//! lock to do so, so it can never interrupt an in-flight call.
//!
//! ## Key Rust Concepts Used:
//! - **`OwnedMutexGuard`**: `lock_owned` ties the guard to an `Arc` instead
//!   of a borrow, so a [`PoolHandle`] can be returned and moved between tasks
//! - **`Drop`** on the handle: releasing cannot be forgotten, even when the
//!   caller returns early with `?`
//! - **`kill_on_drop(true)`**: a worker whose `Child` is dropped is killed

use super::protocol::{decode_line, encode_line, RemoteJob, Request, Response};
use crate::error::{AlignError, AlignResult};
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a worker gets to exit after its stdin is closed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Default cap on one reply line.
pub const DEFAULT_MAX_REPLY_BYTES: u64 = 64 * 1024 * 1024;

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// The running executable, started with the `worker` subcommand.
    pub fn current_exe() -> AlignResult<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| AlignError::pool("locating the current executable", e))?;
        Ok(Self::new(exe).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn build(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Must be 1: the pool exists to isolate memory, not for throughput.
    pub num_processes: usize,
    pub auto_cleanup_timeout: Duration,
    /// Upper bound for one `apply`; `None` waits indefinitely.
    pub apply_timeout: Option<Duration>,
    /// Longest reply line accepted from the worker, newline included.
    pub max_reply_bytes: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_processes: 1,
            auto_cleanup_timeout: Duration::from_secs(60),
            apply_timeout: None,
            max_reply_bytes: DEFAULT_MAX_REPLY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// No worker was ever started.
    Uncreated,
    /// A worker is alive and checked out (or about to be).
    Running,
    /// A worker is alive and idle; the idle timer is armed.
    IdleTimeoutPending,
    /// The worker was shut down, timed out or crashed.
    Terminated,
}

/// Counters for observing pool behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub spawned: u64,
    pub acquired: u64,
    pub released: u64,
    pub applied: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
}

/// State readable without waiting for the slot lock.
#[derive(Debug)]
struct Shared {
    state: StdMutex<PoolState>,
    counters: Counters,
}

impl Shared {
    fn set_state(&self, state: PoolState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn state(&self) -> PoolState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    fn spawn(command: &WorkerCommand) -> AlignResult<Self> {
        let mut child = command
            .build()
            .spawn()
            .map_err(|e| AlignError::pool("spawning worker", e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AlignError::pool("spawning worker", "stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AlignError::pool("spawning worker", "stdout was not captured"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Send one request line and read one reply line of at most `max_bytes`.
    ///
    /// An oversized or non-UTF-8 reply fails with `InvalidData`.
    async fn exchange(&mut self, line: &str, max_bytes: u64) -> io::Result<String> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let mut reply = String::new();
        let read = (&mut self.stdout)
            .take(max_bytes)
            .read_line(&mut reply)
            .await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "worker exited before replying",
            ));
        }
        if !reply.ends_with('\n') && read as u64 >= max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("reply exceeds {} bytes", max_bytes),
            ));
        }
        Ok(reply)
    }

    /// Close stdin and wait for the worker to exit on its own, killing it if
    /// it does not within [`EXIT_GRACE`].
    async fn terminate(self) {
        let WorkerProcess {
            mut child, stdin, ..
        } = self;
        drop(stdin);
        match timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Worker exited"),
            Ok(Err(e)) => warn!("Failed to wait for worker: {}", e),
            Err(_) => {
                warn!("Worker did not exit after stdin closed, killing it");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill worker: {}", e);
                }
            }
        }
    }

    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill worker: {}", e);
        }
    }
}

struct WorkerSlot {
    process: Option<WorkerProcess>,
    /// Bumped whenever the idle timer is re-armed or cancelled; a timer only
    /// acts if the generation it was armed with is still current.
    generation: u64,
    idle_timer: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    fn cancel_idle_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

/// Exclusive access to the pool's worker. Released on drop.
pub struct PoolHandle {
    slot: OwnedMutexGuard<WorkerSlot>,
    shared: Arc<Shared>,
}

impl PoolHandle {
    pub fn worker_pid(&self) -> Option<u32> {
        self.slot.process.as_ref().and_then(WorkerProcess::pid)
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.shared.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    command: WorkerCommand,
    slot: Arc<Mutex<WorkerSlot>>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, command: WorkerCommand) -> AlignResult<Self> {
        if config.num_processes != 1 {
            return Err(AlignError::pool(
                "creating pool",
                format!(
                    "a pool holds exactly one worker process, {} requested",
                    config.num_processes
                ),
            ));
        }

        Ok(Self {
            config,
            command,
            slot: Arc::new(Mutex::new(WorkerSlot {
                process: None,
                generation: 0,
                idle_timer: None,
            })),
            shared: Arc::new(Shared {
                state: StdMutex::new(PoolState::Uncreated),
                counters: Counters::default(),
            }),
        })
    }

    /// Check out the worker, starting a process if none is alive.
    ///
    /// Waits while another caller holds a [`PoolHandle`].
    pub async fn acquire(&self) -> AlignResult<PoolHandle> {
        let mut slot = self.slot.clone().lock_owned().await;
        slot.cancel_idle_timer();

        let alive = slot.process.as_mut().map(WorkerProcess::is_alive).unwrap_or(false);
        if !alive {
            if let Some(dead) = slot.process.take() {
                warn!("Worker process is gone, starting a new one");
                dead.kill().await;
            }
            let process = WorkerProcess::spawn(&self.command)?;
            info!(pid = ?process.pid(), "Started worker process");
            self.shared.counters.spawned.fetch_add(1, Ordering::SeqCst);
            slot.process = Some(process);
        }

        self.shared.set_state(PoolState::Running);
        self.shared.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(PoolHandle {
            slot,
            shared: self.shared.clone(),
        })
    }

    /// Run `job` in the worker and wait for its output.
    ///
    /// ## Errors:
    /// - **Pool**: the worker died, an I/O error occurred, or `apply_timeout`
    ///   expired; the worker is torn down and the next `acquire` restarts it
    /// - **Serialization**: the request or reply could not be encoded/decoded
    /// - any error kind the job itself failed with in the worker
    pub async fn apply<J: RemoteJob>(
        &self,
        handle: &mut PoolHandle,
        job: &J,
    ) -> AlignResult<J::Output> {
        let id = Uuid::new_v4();
        let line = encode_line(&Request { id, job }, "encoding job request")?;

        let slot = &mut *handle.slot;
        let process = slot
            .process
            .as_mut()
            .ok_or_else(|| AlignError::pool("dispatching job", "no worker process is running"))?;

        debug!(job = J::NAME, %id, pid = ?process.pid(), "Dispatching job to worker");
        let max_bytes = self.config.max_reply_bytes;
        let exchanged = match self.config.apply_timeout {
            Some(limit) => timeout(limit, process.exchange(&line, max_bytes))
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reply within {:?}", limit),
                    ))
                }),
            None => process.exchange(&line, max_bytes).await,
        };

        let response = exchanged
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData => AlignError::serialization("reading job reply", e),
                _ => AlignError::pool("exchanging messages with worker", e),
            })
            .and_then(|reply| decode_line::<Response<J::Output>>(&reply, "decoding job reply"))
            .and_then(|response| {
                if response.id == id {
                    Ok(response)
                } else {
                    Err(AlignError::serialization(
                        "matching job reply",
                        format!("expected reply {}, got {}", id, response.id),
                    ))
                }
            });

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                warn!(job = J::NAME, error = %err, "Worker call failed, tearing worker down");
                if let Some(process) = slot.process.take() {
                    process.kill().await;
                }
                self.shared.set_state(PoolState::Terminated);
                self.shared.counters.failed.fetch_add(1, Ordering::SeqCst);
                return Err(err);
            }
        };

        self.arm_idle_timer(slot);
        self.shared.set_state(PoolState::IdleTimeoutPending);
        self.shared.counters.applied.fetch_add(1, Ordering::SeqCst);

        response.outcome.map_err(|wire| {
            self.shared.counters.failed.fetch_add(1, Ordering::SeqCst);
            AlignError::from(wire)
        })
    }

    /// Return a handle to the pool. The worker keeps running.
    pub fn release(&self, handle: PoolHandle) {
        drop(handle);
    }

    /// Terminate the worker now, if there is one. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        slot.cancel_idle_timer();
        if let Some(process) = slot.process.take() {
            info!(pid = ?process.pid(), "Shutting down worker process");
            process.terminate().await;
            self.shared.set_state(PoolState::Terminated);
        }
    }

    /// Current lifecycle state. An idle worker that exited on its own is
    /// reported as `Terminated`; while a caller holds the worker the last
    /// recorded state is returned.
    pub fn state(&self) -> PoolState {
        let state = self.shared.state();
        if state != PoolState::IdleTimeoutPending {
            return state;
        }

        let Ok(mut slot) = self.slot.try_lock() else {
            return state;
        };
        let alive = slot.process.as_mut().map(WorkerProcess::is_alive).unwrap_or(false);
        if alive {
            return state;
        }
        debug!("Idle worker exited on its own");
        self.shared.set_state(PoolState::Terminated);
        PoolState::Terminated
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            spawned: c.spawned.load(Ordering::SeqCst),
            acquired: c.acquired.load(Ordering::SeqCst),
            released: c.released.load(Ordering::SeqCst),
            applied: c.applied.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
        }
    }

    fn arm_idle_timer(&self, slot: &mut WorkerSlot) {
        slot.cancel_idle_timer();
        let generation = slot.generation;
        let idle = self.config.auto_cleanup_timeout;
        let shared_slot = self.slot.clone();
        let shared = self.shared.clone();

        slot.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let mut slot = shared_slot.lock().await;
            if slot.generation != generation {
                return;
            }
            slot.idle_timer = None;
            if let Some(process) = slot.process.take() {
                info!(pid = ?process.pid(), "Worker idle for {:?}, shutting it down", idle);
                process.terminate().await;
                shared.set_state(PoolState::Terminated);
            }
        }));
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // kill_on_drop reaps the child once the process handle is dropped
        if let Ok(mut slot) = self.slot.try_lock() {
            slot.cancel_idle_timer();
            slot.process.take();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl RemoteJob for Ping {
        type Output = String;
        const NAME: &'static str = "ping";
    }

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg(script)
    }

    /// Answers one request with `outcome`, echoing the request id.
    fn reply_once(outcome: &str, then: &str) -> WorkerCommand {
        shell(&format!(
            r#"read line; id=$(echo "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/'); printf '{{"id":"%s","outcome":{}}}\n' "$id"; {}"#,
            outcome, then
        ))
    }

    fn pool(command: WorkerCommand, apply_timeout: Option<Duration>) -> WorkerPool {
        WorkerPool::new(
            WorkerPoolConfig {
                apply_timeout,
                ..WorkerPoolConfig::default()
            },
            command,
        )
        .unwrap()
    }

    #[test]
    fn test_more_than_one_process_is_rejected() {
        let config = WorkerPoolConfig {
            num_processes: 2,
            ..WorkerPoolConfig::default()
        };
        let err = WorkerPool::new(config, shell("true")).err().unwrap();
        assert!(matches!(err, AlignError::Pool { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_without_worker() {
        let pool = pool(shell("cat"), None);
        pool.shutdown().await;
        pool.shutdown().await;
        assert_eq!(pool.state(), PoolState::Uncreated);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[tokio::test]
    async fn test_crash_mid_call_releases_handle_and_restarts() {
        let pool = pool(shell("read line; exit 3"), None);

        let mut handle = pool.acquire().await.unwrap();
        assert_eq!(pool.state(), PoolState::Running);
        let err = pool.apply(&mut handle, &Ping).await.unwrap_err();
        pool.release(handle);

        assert!(matches!(err, AlignError::Pool { .. }));
        assert_eq!(pool.state(), PoolState::Terminated);
        let stats = pool.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.failed, 1);

        // the slot is free again and a fresh worker is started
        let handle = pool.acquire().await.unwrap();
        assert_eq!(pool.state(), PoolState::Running);
        assert_eq!(pool.stats().spawned, 2);
        drop(handle);
        assert_eq!(pool.stats().released, 2);
        pool.shutdown().await;
        assert_eq!(pool.state(), PoolState::Terminated);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_timeout_terminates_worker() {
        let pool = pool(shell("read line; sleep 30"), Some(Duration::from_millis(200)));

        let mut handle = pool.acquire().await.unwrap();
        let err = pool.apply(&mut handle, &Ping).await.unwrap_err();
        pool.release(handle);

        assert!(err.to_string().contains("no reply within"));
        assert_eq!(pool.state(), PoolState::Terminated);
    }

    #[tokio::test]
    async fn test_echoed_request_is_rejected_as_mismatched_reply() {
        // `cat` echoes the request line back, which is not a reply
        let pool = pool(shell("cat"), None);

        let mut handle = pool.acquire().await.unwrap();
        let err = pool.apply(&mut handle, &Ping).await.unwrap_err();
        pool.release(handle);

        assert!(matches!(err, AlignError::Serialization { .. }));
        assert_eq!(pool.state(), PoolState::Terminated);
    }

    #[tokio::test]
    async fn test_oversized_reply_is_serialization_error() {
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                max_reply_bytes: 64,
                ..WorkerPoolConfig::default()
            },
            shell("read line; printf '%0200d\\n' 0; sleep 30"),
        )
        .unwrap();

        let mut handle = pool.acquire().await.unwrap();
        let err = pool.apply(&mut handle, &Ping).await.unwrap_err();
        pool.release(handle);

        assert!(matches!(err, AlignError::Serialization { .. }));
        assert!(err.to_string().contains("reply exceeds 64 bytes"));
        assert_eq!(pool.state(), PoolState::Terminated);
    }

    #[tokio::test]
    async fn test_idle_worker_that_exits_reports_terminated() {
        let pool = pool(reply_once(r#"{"Ok":"pong"}"#, "exit 0"), None);

        let mut handle = pool.acquire().await.unwrap();
        let reply = pool.apply(&mut handle, &Ping).await.unwrap();
        pool.release(handle);
        assert_eq!(reply, "pong");

        let mut state = pool.state();
        for _ in 0..50 {
            if state == PoolState::Terminated {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = pool.state();
        }
        assert_eq!(state, PoolState::Terminated);

        // the dead worker is replaced on the next acquire
        let handle = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().spawned, 2);
        drop(handle);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_program_is_pool_error() {
        let pool = pool(WorkerCommand::new("/nonexistent/speech-align-worker"), None);
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, AlignError::Pool { context: "spawning worker", .. }));
        assert_eq!(pool.state(), PoolState::Uncreated);
        assert_eq!(pool.stats().acquired, 0);
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let pool = Arc::new(pool(shell("cat"), None));
        let first = pool.acquire().await.unwrap();

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        pool.release(first);
        waiting.await.unwrap().unwrap();
        assert_eq!(pool.stats().acquired, 2);
        pool.shutdown().await;
    }
}
