//! Applying operations to whole arrays.

use crate::error::Result;
use crate::execution::{NoProgress, ParallelEngine, ProgressReporter, Roi, Task, TaskKind};
use crate::memory::{Allocator, SharedArray};

/// Runs a [`TaskKind`] over every slice of an array.
#[derive(Debug, Clone, Copy)]
pub struct Operation<'a> {
    allocator: &'a Allocator,
    engine: &'a ParallelEngine,
    cores: Option<usize>,
    chunksize: Option<usize>,
}

impl<'a> Operation<'a> {
    /// Operation allocating snapshots from `allocator` and running on
    /// `engine`.
    pub fn new(allocator: &'a Allocator, engine: &'a ParallelEngine) -> Self {
        Self {
            allocator,
            engine,
            cores: None,
            chunksize: None,
        }
    }

    /// Use at most `cores` processes.
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = Some(cores);
        self
    }

    /// Dispatch `chunksize` slices at a time.
    pub fn with_chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = Some(chunksize);
        self
    }

    /// Modify `array` in place.
    ///
    /// The work may happen in other processes, so the array is borrowed
    /// mutably for the duration. On failure some slices may already be
    /// modified.
    pub fn apply(
        &self,
        array: &mut SharedArray,
        kind: TaskKind,
        roi: Option<Roi>,
        progress: &mut dyn ProgressReporter,
    ) -> Result<()> {
        let label = kind.name();
        let mut task = Task::new(array, kind);
        task.roi = roi;
        self.run(array, &task, progress, label)
    }

    /// Apply to a copy of `array` and return the copy. `array` itself is
    /// never modified.
    ///
    /// The copy is a new segment owned by the allocator. On failure it is
    /// freed again.
    pub fn apply_safe(
        &self,
        array: &SharedArray,
        kind: TaskKind,
        roi: Option<Roi>,
        progress: &mut dyn ProgressReporter,
    ) -> Result<SharedArray> {
        let mut snapshot = self.allocator.create(array.shape(), array.dtype())?;
        tracing::debug!(source = array.name(), snapshot = snapshot.name(), "snapshotting array");

        let copy = Task::new(
            &snapshot,
            TaskKind::CopyFrom {
                source: array.array_ref(),
            },
        );
        let result = self
            .run(&snapshot, &copy, &mut NoProgress, "Copying")
            .and_then(|()| self.apply(&mut snapshot, kind, roi, progress));

        match result {
            Ok(()) => Ok(snapshot),
            Err(e) => {
                if let Err(free_err) = self.allocator.free(snapshot) {
                    tracing::warn!(error = %free_err, "failed to free snapshot");
                }
                Err(e)
            }
        }
    }

    fn run(
        &self,
        array: &SharedArray,
        task: &Task,
        progress: &mut dyn ProgressReporter,
        label: &str,
    ) -> Result<()> {
        let cores = self.engine.plan_cores(array.shape(), self.cores);
        self.engine.execute(
            array.num_slices(),
            task,
            cores,
            self.chunksize,
            progress,
            label,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ShmConfig};
    use crate::error::Error;
    use crate::memory::DType;

    fn setup() -> (tempfile::TempDir, Allocator, ParallelEngine) {
        let dir = tempfile::tempdir().unwrap();
        let shm = ShmConfig::default().with_dir(dir.path());
        let allocator = Allocator::new(&shm).unwrap();
        let engine = ParallelEngine::sequential(&shm, EngineConfig::default());
        (dir, allocator, engine)
    }

    #[test]
    fn test_apply_in_place() {
        let (_dir, allocator, engine) = setup();
        let mut array = allocator.create(&[3, 2, 2], DType::F32).unwrap();
        array.as_mut_slice::<f32>().unwrap().fill(2.0);

        let mut steps = 0;
        Operation::new(&allocator, &engine)
            .apply(
                &mut array,
                TaskKind::Scale { factor: 0.5 },
                None,
                &mut |n: usize, label: &str| {
                    assert_eq!(label, "scale");
                    steps += n;
                },
            )
            .unwrap();

        assert_eq!(steps, 3);
        assert!(array.as_slice::<f32>().unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_apply_safe_leaves_original() {
        let (_dir, allocator, engine) = setup();
        let mut array = allocator.create(&[2, 3, 3], DType::U16).unwrap();
        array.as_mut_slice::<u16>().unwrap().fill(7);

        let result = Operation::new(&allocator, &engine)
            .apply_safe(
                &array,
                TaskKind::Fill { value: 1.0 },
                Some(Roi::new(0, 0, 2, 2)),
                &mut NoProgress,
            )
            .unwrap();

        assert!(array.as_slice::<u16>().unwrap().iter().all(|&v| v == 7));
        assert_eq!(result.slice::<u16>(1).unwrap(), &[1, 1, 7, 1, 1, 7, 7, 7, 7]);
        assert!(allocator.is_owned(result.name()));
        assert_ne!(result.name(), array.name());
    }

    #[test]
    fn test_apply_safe_failure_frees_snapshot() {
        let (_dir, allocator, engine) = setup();
        let array = allocator.create(&[2, 3, 3], DType::U8).unwrap();

        let err = Operation::new(&allocator, &engine)
            .apply_safe(
                &array,
                TaskKind::Fill { value: 1.0 },
                Some(Roi::new(0, 0, 9, 9)),
                &mut NoProgress,
            )
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert_eq!(allocator.owned_names(), vec![array.name().to_string()]);
    }
}
