//! # tomopar
//!
//! Parallel, shared-memory processing of tomography image stacks.
//!
//! Volumes live in named shared memory segments. A pool of worker
//! processes maps the same segments and each worker processes its own range
//! of slices along the leading axis, so pixel data is never copied between
//! processes.
//!
//! ## Features
//!
//! - **Named shared arrays**: `/dev/shm` segments tagged with the creating pid
//! - **Orphan reclamation**: segments left by crashed runs are removed on start
//! - **Process pool**: clean-slate worker executables driven over pipes
//! - **Chunked dispatch**: ordered progress and first-error propagation
//! - **rkyv serialization**: compact task descriptors on the control channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tomopar::prelude::*;
//!
//! let session = Session::start(Config::from_env()?)?;
//! let paths: Vec<PathBuf> = /* projection files */;
//!
//! let mut progress = LoggingProgress::new(paths.len());
//! let mut stack = session.loader().load(&paths, DType::F32, &mut progress)?;
//! session
//!     .operation()
//!     .apply(&mut stack, TaskKind::Scale { factor: 2.0 }, None, &mut NoProgress)?;
//!
//! session.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod execution;
pub mod loader;
pub mod memory;
pub mod operation;
pub mod session;
pub mod worker;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{Config, EngineConfig, PoolConfig, ShmConfig};
    pub use crate::error::{Error, Result};
    pub use crate::execution::{
        LoggingProgress, NoProgress, ParallelEngine, PoolState, ProgressReporter, Roi, Task,
        TaskKind, WorkerPool,
    };
    pub use crate::loader::StackLoader;
    pub use crate::memory::{Allocator, ArrayRef, DType, Reaper, SharedArray};
    pub use crate::operation::Operation;
    pub use crate::session::{Session, ShutdownReport};
}

pub use error::{Error, Result};
