//! Shared memory management for tomopar.
//!
//! This module provides named shared arrays that worker processes map
//! independently, so a volume is never copied across a process boundary.
//!
//! # Architecture
//!
//! - [`SharedArray`]: A mapped segment interpreted as an n-dimensional array
//! - [`Allocator`]: Creates and frees segments, tracks what this process owns
//! - [`SegmentName`]: The `{prefix}_{pid}_{token}` naming convention
//! - [`Reaper`]: Reclaims segments whose creating process has died
//!
//! # Example
//!
//! ```rust,ignore
//! use tomopar::config::ShmConfig;
//! use tomopar::memory::{Allocator, DType};
//!
//! let alloc = Allocator::new(&ShmConfig::default())?;
//!
//! // 20 projections of 16x16 float32 pixels, zero-initialised
//! let mut stack = alloc.create(&[20, 16, 16], DType::F32)?;
//! stack.slice_mut::<f32>(0)?.fill(1.0);
//!
//! // Workers attach with `stack.array_ref()`; free when the stack is closed
//! alloc.free(stack)?;
//! ```

mod allocator;
mod dtype;
mod liveness;
mod name;
mod reaper;
mod shared_array;

pub use allocator::Allocator;
pub use dtype::{DType, Element};
pub(crate) use dtype::with_element;
pub use liveness::{ProcessProbe, ProcessStatus, SystemProbe, process_start_time};
pub use name::{DEFAULT_PREFIX, SegmentName};
pub(crate) use name::validate_prefix;
pub use reaper::{ReclaimReport, Reaper};
pub use shared_array::{ArrayRef, SharedArray};
