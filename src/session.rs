//! Application lifetime of the shared memory core.
//!
//! A [`Session`] wires the allocator, reaper, worker pool and engine
//! together. Starting one cleans up after earlier crashed runs; shutting it
//! down (or dropping it) terminates the workers and removes every segment
//! this process created.

use crate::config::Config;
use crate::error::Result;
use crate::execution::{ParallelEngine, WorkerPool};
use crate::loader::StackLoader;
use crate::memory::{Allocator, ReclaimReport, Reaper};
use crate::operation::Operation;
use std::sync::Arc;

/// Summary of what [`Session::shutdown`] cleaned up.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Owned segments freed.
    pub freed_owned: usize,
    /// Further segments carrying this process's pid.
    pub cleared: ReclaimReport,
}

/// The running core: allocator, worker pool and engine.
#[derive(Debug)]
pub struct Session {
    config: Config,
    allocator: Allocator,
    reaper: Reaper,
    pool: Arc<WorkerPool>,
    engine: ParallelEngine,
    shut_down: bool,
}

impl Session {
    /// Reclaim orphaned segments, start the worker pool and build the
    /// engine.
    pub fn start(config: Config) -> Result<Self> {
        let allocator = Allocator::new(&config.shm)?;
        let reaper = Reaper::new(&config.shm)?;

        match reaper.reclaim_orphans() {
            Ok(report) if !report.failed.is_empty() => tracing::warn!(
                failed = report.failed.len(),
                "some orphaned segments could not be reclaimed"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "orphan scan failed"),
        }

        let pool = Arc::new(WorkerPool::new(config.pool.clone(), &config.shm));
        pool.start()?;
        let engine = ParallelEngine::new(Arc::clone(&pool), &config.shm, config.engine.clone());

        tracing::info!(
            workers = pool.worker_count(),
            shm_dir = %config.shm.dir.display(),
            prefix = %config.shm.prefix,
            "session started"
        );
        Ok(Self {
            config,
            allocator,
            reaper,
            pool,
            engine,
            shut_down: false,
        })
    }

    /// Configuration the session was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared memory allocator.
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// The orphan reaper for this namespace.
    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// The worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The execution engine.
    pub fn engine(&self) -> &ParallelEngine {
        &self.engine
    }

    /// A stack loader bound to this session.
    pub fn loader(&self) -> StackLoader<'_> {
        StackLoader::new(&self.allocator, &self.engine)
    }

    /// An operation runner bound to this session.
    pub fn operation(&self) -> Operation<'_> {
        Operation::new(&self.allocator, &self.engine)
    }

    /// Stop the workers and remove this process's segments.
    ///
    /// Outstanding [`SharedArray`](crate::memory::SharedArray) handles stay
    /// mapped until dropped, but their names are gone.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.teardown()
    }

    fn teardown(&mut self) -> ShutdownReport {
        self.shut_down = true;
        self.pool.stop();

        let freed_owned = self.allocator.free_all_owned();
        let cleared = match self.reaper.clear_memory_owned_by_current_process() {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "could not scan for leftover segments");
                ReclaimReport::default()
            }
        };
        tracing::info!(
            freed = freed_owned,
            cleared = cleared.freed_count(),
            "session shut down"
        );
        ShutdownReport {
            freed_owned,
            cleared,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.shut_down {
            self.teardown();
        }
    }
}
