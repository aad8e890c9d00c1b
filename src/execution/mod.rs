//! Parallel execution over the leading axis of shared arrays.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     ParallelEngine                              │
//! │  - Decides sequential vs. parallel                              │
//! │  - Partitions 0..N into chunks                                  │
//! │  - Reports progress in index order                              │
//! └───────────────┬─────────────────────────────────────────────────┘
//!                 │ WorkerPool: Task + index range (stdin/stdout + rkyv)
//!     ┌───────────┼───────────┬───────────────────┐
//!     ▼           ▼           ▼                   ▼
//! ┌───────┐  ┌───────┐  ┌───────┐            ┌───────┐
//! │Worker │  │Worker │  │Worker │    ...     │Worker │
//! │   0   │  │   1   │  │   2   │            │  n-1  │
//! └───────┘  └───────┘  └───────┘            └───────┘
//!     │           │           │                   │
//!     └───────────┴───────────┴───────────────────┘
//!          Shared Memory (named segments in /dev/shm)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use tomopar::execution::{LoggingProgress, Task, TaskKind};
//!
//! let task = Task::new(&stack, TaskKind::Scale { factor: 2.0 });
//! let cores = engine.plan_cores(stack.shape(), None);
//! engine.execute(stack.num_slices(), &task, cores, None, &mut LoggingProgress::new(stack.num_slices()), "Scale")?;
//! ```

mod engine;
mod pool;
mod progress;
mod protocol;
mod task;

pub use engine::{
    PARALLEL_THRESHOLD, ParallelEngine, default_chunksize, partition, run_sequential,
    should_parallelize,
};
pub use pool::{PoolState, WorkerPool};
pub use progress::{LoggingProgress, NoProgress, ProgressReporter};
pub use protocol::{
    MAX_FRAME_LEN, Message, Request, Response, TaskFailure, frame_message, read_message,
    unframe_message, write_message,
};
pub use task::{BoundTask, Roi, Task, TaskKind, pattern_value};
