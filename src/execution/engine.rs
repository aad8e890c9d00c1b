//! Parallel execution engine.
//!
//! Splits the leading axis of an array into chunks, hands the chunks to the
//! worker pool, and reports progress as items finish. Small jobs and
//! single-core requests run in the calling process.

use super::pool::{ChunkOutcome, WorkerPool};
use super::progress::ProgressReporter;
use super::task::Task;
use crate::config::{EngineConfig, ShmConfig};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

/// Arrays with at most this many slices are processed sequentially.
pub const PARALLEL_THRESHOLD: usize = 10;

/// Chunks per worker targeted by [`default_chunksize`].
const CHUNKS_PER_WORKER: usize = 4;

/// Whether an array of `shape` is worth spreading over `cores` processes.
pub fn should_parallelize(shape: &[usize], cores: usize) -> bool {
    cores > 1 && shape.first().is_some_and(|&n| n > PARALLEL_THRESHOLD)
}

/// Chunk size used when the caller does not pick one: about four chunks
/// per core, and never zero.
pub fn default_chunksize(total_items: usize, cores: usize) -> usize {
    (total_items / (cores.max(1) * CHUNKS_PER_WORKER)).max(1)
}

/// Split `0..total_items` into consecutive ranges of `chunksize` items.
/// The last range may be shorter.
pub fn partition(total_items: usize, chunksize: usize) -> Vec<Range<usize>> {
    let chunksize = chunksize.max(1);
    (0..total_items)
        .step_by(chunksize)
        .map(|start| start..(start + chunksize).min(total_items))
        .collect()
}

/// Call `work` for each index in order, reporting one step per index.
///
/// Stops at the first error.
pub fn run_sequential<F>(
    total_items: usize,
    mut work: F,
    progress: &mut dyn ProgressReporter,
    label: &str,
) -> Result<()>
where
    F: FnMut(usize) -> Result<()>,
{
    for index in 0..total_items {
        work(index)?;
        progress.update(1, label);
    }
    Ok(())
}

/// Runs tasks over the leading axis of shared arrays.
#[derive(Debug)]
pub struct ParallelEngine {
    pool: Option<Arc<WorkerPool>>,
    shm_dir: PathBuf,
    config: EngineConfig,
}

impl ParallelEngine {
    /// Engine dispatching to `pool`.
    pub fn new(pool: Arc<WorkerPool>, shm: &ShmConfig, config: EngineConfig) -> Self {
        Self {
            pool: Some(pool),
            shm_dir: shm.dir.clone(),
            config,
        }
    }

    /// Engine without workers. Every task runs in the calling process.
    pub fn sequential(shm: &ShmConfig, config: EngineConfig) -> Self {
        Self {
            pool: None,
            shm_dir: shm.dir.clone(),
            config,
        }
    }

    /// The worker pool, if any.
    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    /// Processes available for parallel work: the live workers of a running
    /// pool, or the configured count when it is not running.
    pub fn available_cores(&self) -> usize {
        match &self.pool {
            Some(pool) if pool.is_running() => pool.live_workers().max(1),
            Some(pool) => pool.worker_count(),
            None => 1,
        }
    }

    /// Cores to use for an array of `shape`: `requested` or every worker,
    /// dropping to one when the array is too small to be worth it.
    pub fn plan_cores(&self, shape: &[usize], requested: Option<usize>) -> usize {
        let cores = requested.unwrap_or_else(|| self.available_cores()).max(1);
        if should_parallelize(shape, cores) {
            cores
        } else {
            1
        }
    }

    /// Apply `task` to leading-axis indices `0..total_items`.
    ///
    /// With `cores == 1` (or no pool) items run here, in order. Otherwise
    /// they are split into chunks of `chunksize` (default policy when
    /// `None`) and spread over up to `cores` workers. In both cases
    /// `progress` gets one step per finished item, in index order, and the
    /// first error is returned.
    pub fn execute(
        &self,
        total_items: usize,
        task: &Task,
        cores: usize,
        chunksize: Option<usize>,
        progress: &mut dyn ProgressReporter,
        label: &str,
    ) -> Result<()> {
        if total_items == 0 {
            return Ok(());
        }
        task.validate(total_items)?;

        match &self.pool {
            Some(pool) if cores > 1 => {
                let chunksize = chunksize
                    .or(self.config.chunksize)
                    .unwrap_or_else(|| default_chunksize(total_items, cores));
                self.execute_parallel(pool, total_items, task, cores, chunksize, progress, label)
            }
            _ => self.execute_local(total_items, task, progress, label),
        }
    }

    fn execute_local(
        &self,
        total_items: usize,
        task: &Task,
        progress: &mut dyn ProgressReporter,
        label: &str,
    ) -> Result<()> {
        tracing::debug!(task = task.kind.name(), items = total_items, "running in process");
        let mut bound = task.attach(&self.shm_dir)?;
        run_sequential(total_items, |index| bound.apply(index), progress, label)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_parallel(
        &self,
        pool: &WorkerPool,
        total_items: usize,
        task: &Task,
        cores: usize,
        chunksize: usize,
        progress: &mut dyn ProgressReporter,
        label: &str,
    ) -> Result<()> {
        let chunks = partition(total_items, chunksize);
        tracing::debug!(
            task = task.kind.name(),
            items = total_items,
            chunksize,
            chunks = chunks.len(),
            cores,
            "running on worker pool"
        );

        let mut tracker = ProgressTracker::default();
        let mut first_error = None;
        pool.run_chunks(task, &chunks, cores, &mut |outcome: ChunkOutcome| {
            match outcome.result {
                Ok(()) => {
                    for _ in 0..tracker.complete(outcome.range) {
                        progress.update(1, label);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        tracing::warn!(
                            task = task.kind.name(),
                            chunk = ?outcome.range,
                            error = %e,
                            "chunk failed"
                        );
                        first_error = Some(e);
                    }
                }
            }
        })?;

        match first_error {
            Some(e) => Err(e),
            None if tracker.reported == total_items => Ok(()),
            None => Err(Error::Protocol(format!(
                "only {} of {total_items} items completed",
                tracker.reported
            ))),
        }
    }
}

/// Turns out-of-order chunk completions into in-order progress steps.
#[derive(Debug, Default)]
struct ProgressTracker {
    /// Items `0..reported` have been reported.
    reported: usize,
    /// Finished items beyond a gap.
    pending: BTreeSet<usize>,
}

impl ProgressTracker {
    /// Record a finished range. Returns how many items became reportable.
    fn complete(&mut self, range: Range<usize>) -> usize {
        self.pending.extend(range);
        let before = self.reported;
        while self.pending.remove(&self.reported) {
            self.reported += 1;
        }
        self.reported - before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::task::TaskKind;
    use crate::memory::{Allocator, DType};

    #[test]
    fn test_should_parallelize() {
        assert!(!should_parallelize(&[10, 4, 4], 4));
        assert!(should_parallelize(&[11, 4, 4], 4));
        assert!(!should_parallelize(&[100, 4, 4], 1));
        assert!(!should_parallelize(&[], 4));
    }

    #[test]
    fn test_default_chunksize() {
        assert_eq!(default_chunksize(100, 4), 6);
        assert_eq!(default_chunksize(3, 8), 1);
        assert_eq!(default_chunksize(0, 0), 1);
    }

    #[test]
    fn test_partition_covers_every_index_once() {
        for (total, chunksize) in [(20, 3), (20, 1), (20, 20), (20, 50), (7, 0), (0, 4)] {
            let chunks = partition(total, chunksize);
            let covered: Vec<usize> = chunks.iter().cloned().flatten().collect();
            assert_eq!(covered, (0..total).collect::<Vec<_>>(), "{total}/{chunksize}");
            assert!(chunks.iter().all(|c| !c.is_empty()));
        }
        assert_eq!(partition(20, 3).len(), 7);
        assert_eq!(partition(20, 3)[6], 18..20);
    }

    #[test]
    fn test_run_sequential_in_order() {
        let mut seen = Vec::new();
        let mut steps = 0;
        run_sequential(
            5,
            |i| {
                seen.push(i);
                Ok(())
            },
            &mut |n: usize, _: &str| steps += n,
            "test",
        )
        .unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(steps, 5);
    }

    #[test]
    fn test_run_sequential_stops_at_first_error() {
        let mut steps = 0;
        let result = run_sequential(
            5,
            |i| {
                if i == 2 {
                    Err(Error::WorkerTask {
                        index: i,
                        message: "bad".into(),
                    })
                } else {
                    Ok(())
                }
            },
            &mut |n: usize, _: &str| steps += n,
            "test",
        );
        assert!(matches!(result, Err(Error::WorkerTask { index: 2, .. })));
        assert_eq!(steps, 2);
    }

    #[test]
    fn test_progress_tracker_reorders() {
        let mut tracker = ProgressTracker::default();
        assert_eq!(tracker.complete(3..6), 0);
        assert_eq!(tracker.complete(7..9), 0);
        assert_eq!(tracker.complete(0..3), 6);
        assert_eq!(tracker.complete(6..7), 3);
        assert_eq!(tracker.reported, 9);
        assert!(tracker.pending.is_empty());
    }

    #[test]
    fn test_sequential_engine_executes_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let shm = ShmConfig::default().with_dir(dir.path());
        let alloc = Allocator::new(&shm).unwrap();
        let mut array = alloc.create(&[20, 4, 4], DType::F32).unwrap();
        array.as_mut_slice::<f32>().unwrap().fill(1.0);

        let engine = ParallelEngine::sequential(&shm, EngineConfig::default());
        assert_eq!(engine.plan_cores(array.shape(), None), 1);

        let task = Task::new(&array, TaskKind::Scale { factor: 3.0 });
        let mut steps = 0;
        engine
            .execute(20, &task, 4, Some(3), &mut |n: usize, _: &str| steps += n, "Scale")
            .unwrap();

        assert_eq!(steps, 20);
        assert!(array.as_slice::<f32>().unwrap().iter().all(|&v| v == 3.0));
        alloc.free(array).unwrap();
    }

    #[test]
    fn test_zero_items_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let shm = ShmConfig::default().with_dir(dir.path());
        let alloc = Allocator::new(&shm).unwrap();
        let array = alloc.create(&[0, 4, 4], DType::U8).unwrap();

        let engine = ParallelEngine::sequential(&shm, EngineConfig::default());
        let task = Task::new(&array, TaskKind::Fill { value: 1.0 });
        let mut steps = 0;
        engine
            .execute(0, &task, 4, None, &mut |n: usize, _: &str| steps += n, "noop")
            .unwrap();
        assert_eq!(steps, 0);
    }

    #[test]
    fn test_plan_cores() {
        let shm = ShmConfig::default();
        let engine = ParallelEngine::sequential(&shm, EngineConfig::default());
        assert_eq!(engine.plan_cores(&[100, 4, 4], Some(4)), 4);
        assert_eq!(engine.plan_cores(&[5, 4, 4], Some(4)), 1);
        assert_eq!(engine.plan_cores(&[100, 4, 4], Some(0)), 1);
    }
}
