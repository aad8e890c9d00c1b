//! Pool of worker processes.
//!
//! Workers are separate executables started with a clean address space.
//! Each one is driven over its stdin/stdout with the framed messages from
//! [`protocol`](super::protocol) and maps shared arrays by name, so the only
//! data that crosses the pipe is a task descriptor and an index range.
//!
//! The pool moves through three states:
//!
//! ```text
//! Uncreated --start--> Running --stop--> Stopped
//! ```
//!
//! A stopped pool cannot be restarted; build a new one instead.

use super::protocol::{Request, Response, read_message, write_message};
use super::task::Task;
use crate::config::{PoolConfig, ShmConfig};
use crate::error::{Error, Result};
use std::io::{BufReader, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

/// Lifecycle state of a [`WorkerPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    /// No workers have been started.
    Uncreated,
    /// Workers are up and accepting chunks.
    Running,
    /// Workers were terminated; the pool is closed for good.
    Stopped,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uncreated => write!(f, "Uncreated"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Result of dispatching one chunk.
#[derive(Debug)]
pub(crate) struct ChunkOutcome {
    /// Items covered by the chunk.
    pub range: Range<usize>,
    pub result: Result<()>,
}

/// Control channel to one worker.
struct WorkerChannel {
    id: usize,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    alive: bool,
}

impl WorkerChannel {
    fn send(&mut self, request: &Request) -> Result<()> {
        let sent = write_message(&mut self.stdin, request).and_then(|()| {
            self.stdin.flush()?;
            Ok(())
        });
        sent.map_err(|e| self.crashed(e))
    }

    fn receive(&mut self) -> Result<Response> {
        match read_message(&mut self.stdout) {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(self.crashed(Error::Protocol("control channel closed".into()))),
            Err(e) => Err(self.crashed(e)),
        }
    }

    fn run_chunk(&mut self, task: &Task, range: Range<usize>) -> Result<()> {
        let (start, end) = (range.start as u64, range.end as u64);
        self.send(&Request::Run {
            task: task.clone(),
            start,
            end,
        })?;
        match self.receive()? {
            Response::Done { start: s, end: e } if (s, e) == (start, end) => Ok(()),
            Response::Failed { failure } => Err(failure.into_error()),
            other => Err(self.crashed(Error::Protocol(format!(
                "unexpected reply to chunk {start}..{end}: {other:?}"
            )))),
        }
    }

    fn crashed(&mut self, cause: Error) -> Error {
        if self.alive {
            tracing::error!(worker = self.id, error = %cause, "worker lost");
        }
        self.alive = false;
        Error::WorkerCrashed {
            worker: self.id,
            reason: cause.to_string(),
        }
    }
}

/// A fixed set of worker processes.
pub struct WorkerPool {
    config: PoolConfig,
    shm_dir: PathBuf,
    state: Mutex<PoolState>,
    children: Mutex<Vec<Child>>,
    channels: Mutex<Vec<WorkerChannel>>,
    next_seq: AtomicU64,
}

impl WorkerPool {
    /// Create an unstarted pool.
    pub fn new(config: PoolConfig, shm: &ShmConfig) -> Self {
        Self {
            config,
            shm_dir: shm.dir.clone(),
            state: Mutex::new(PoolState::Uncreated),
            children: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        *lock(&self.state)
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.state() == PoolState::Running
    }

    /// Number of workers the pool starts.
    pub fn worker_count(&self) -> usize {
        self.config.worker_count()
    }

    /// Process ids of the spawned workers, dead or alive.
    pub fn worker_pids(&self) -> Vec<u32> {
        lock(&self.children).iter().map(Child::id).collect()
    }

    /// Number of workers whose control channel is intact.
    pub fn live_workers(&self) -> usize {
        lock(&self.channels).iter().filter(|c| c.alive).count()
    }

    /// Spawn the workers and wait until each answers a ping.
    ///
    /// Starting a running pool is a no-op. Starting a stopped pool fails
    /// with [`Error::PoolStopped`].
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            PoolState::Running => return Ok(()),
            PoolState::Stopped => return Err(Error::PoolStopped),
            PoolState::Uncreated => {}
        }

        let program = self.config.resolve_worker_program()?;
        let count = self.config.worker_count();
        let mut children = Vec::with_capacity(count);
        let mut channels = Vec::with_capacity(count);

        for id in 0..count {
            match spawn_worker(&program, &self.shm_dir, id) {
                Ok((child, channel)) => {
                    children.push(child);
                    channels.push(channel);
                }
                Err(e) => {
                    terminate(&mut children);
                    return Err(e);
                }
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = warm_up(&mut channels, seq) {
            terminate(&mut children);
            return Err(e);
        }

        *lock(&self.children) = children;
        *lock(&self.channels) = channels;
        *state = PoolState::Running;
        tracing::info!(workers = count, program = %program.display(), "worker pool started");
        Ok(())
    }

    /// Ping every live worker. Returns how many answered.
    pub fn ping(&self) -> Result<usize> {
        self.ensure_running()?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut channels = lock(&self.channels);
        let mut answered = 0;
        for channel in channels.iter_mut().filter(|c| c.alive) {
            if channel.send(&Request::Ping { seq }).is_err() {
                continue;
            }
            match channel.receive() {
                Ok(Response::Pong { seq: s }) if s == seq => answered += 1,
                Ok(other) => {
                    channel.crashed(Error::Protocol(format!("unexpected reply to ping: {other:?}")));
                }
                Err(_) => {}
            }
        }
        Ok(answered)
    }

    /// Terminate every worker without waiting for in-flight work.
    ///
    /// Chunks still running fail with [`Error::WorkerCrashed`]. The pool
    /// cannot be started again afterwards.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), PoolState::Stopped);
        if previous != PoolState::Running {
            return;
        }

        terminate(&mut lock(&self.children));

        // A run in progress holds the channels; it drops them when its
        // reads fail.
        match self.channels.try_lock() {
            Ok(mut channels) => channels.clear(),
            Err(TryLockError::Poisoned(p)) => p.into_inner().clear(),
            Err(TryLockError::WouldBlock) => {}
        }
        tracing::info!("worker pool stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            PoolState::Running => Ok(()),
            PoolState::Uncreated => Err(Error::PoolNotRunning),
            PoolState::Stopped => Err(Error::PoolStopped),
        }
    }

    /// Dispatch `chunks` of `task` across at most `parallelism` workers.
    ///
    /// Each driving worker pulls the next undispatched chunk when it
    /// finishes one. `on_complete` runs on the calling thread once per
    /// finished chunk, in completion order. After the first failure no new
    /// chunks are dispatched.
    pub(crate) fn run_chunks(
        &self,
        task: &Task,
        chunks: &[Range<usize>],
        parallelism: usize,
        on_complete: &mut dyn FnMut(ChunkOutcome),
    ) -> Result<()> {
        self.ensure_running()?;

        let mut channels = lock(&self.channels);
        let live: Vec<&mut WorkerChannel> = channels
            .iter_mut()
            .filter(|c| c.alive)
            .take(parallelism.max(1))
            .collect();
        if live.is_empty() {
            return Err(Error::WorkerCrashed {
                worker: 0,
                reason: "no live workers remain".into(),
            });
        }
        tracing::debug!(
            task = task.kind.name(),
            chunks = chunks.len(),
            workers = live.len(),
            "dispatching chunks"
        );

        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let (tx, rx) = kanal::unbounded::<ChunkOutcome>();

        std::thread::scope(|scope| {
            for channel in live {
                let tx = tx.clone();
                let (next, abort) = (&next, &abort);
                scope.spawn(move || {
                    while !abort.load(Ordering::Acquire) {
                        let Some(range) = chunks.get(next.fetch_add(1, Ordering::AcqRel)) else {
                            break;
                        };
                        let result = channel.run_chunk(task, range.clone());
                        if result.is_err() {
                            abort.store(true, Ordering::Release);
                        }
                        let outcome = ChunkOutcome {
                            range: range.clone(),
                            result,
                        };
                        if tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            while let Ok(outcome) = rx.recv() {
                on_complete(outcome);
            }
        });

        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("state", &self.state())
            .field("workers", &self.worker_count())
            .field("shm_dir", &self.shm_dir)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_worker(program: &Path, shm_dir: &Path, id: usize) -> Result<(Child, WorkerChannel)> {
    let mut child = Command::new(program)
        .arg("--shm-dir")
        .arg(shm_dir)
        .arg("--index")
        .arg(id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::WorkerSpawn(format!("{}: {e}", program.display())))?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        terminate(&mut vec![child]);
        return Err(Error::WorkerSpawn("worker pipes unavailable".into()));
    };

    tracing::debug!(worker = id, pid = child.id(), "spawned worker");
    let channel = WorkerChannel {
        id,
        stdin,
        stdout: BufReader::new(stdout),
        alive: true,
    };
    Ok((child, channel))
}

/// Ping all workers at once, then collect the answers.
fn warm_up(channels: &mut [WorkerChannel], seq: u64) -> Result<()> {
    for channel in channels.iter_mut() {
        channel.send(&Request::Ping { seq })?;
    }
    for channel in channels.iter_mut() {
        match channel.receive()? {
            Response::Pong { seq: s } if s == seq => {}
            other => {
                return Err(channel.crashed(Error::Protocol(format!(
                    "unexpected reply to ping: {other:?}"
                ))));
            }
        }
    }
    Ok(())
}

/// Kill and reap every child.
fn terminate(children: &mut Vec<Child>) {
    for child in children.iter_mut() {
        if let Err(e) = child.kill() {
            tracing::debug!(pid = child.id(), error = %e, "kill failed");
        }
    }
    for mut child in children.drain(..) {
        match child.wait() {
            Ok(status) => tracing::trace!(pid = child.id(), %status, "worker reaped"),
            Err(e) => tracing::warn!(pid = child.id(), error = %e, "failed to reap worker"),
        }
    }
}
