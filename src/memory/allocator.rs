//! Shared memory allocator and the per-process ownership record.

use super::dtype::DType;
use super::name::{SegmentName, validate_prefix};
use super::shared_array::SharedArray;
use crate::config::ShmConfig;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Creates and frees named shared arrays, remembering which ones this
/// process owns.
///
/// Only owned segments may be freed through the allocator. The record is
/// plain process-local bookkeeping and is never persisted; the
/// [`Reaper`](super::Reaper) covers whatever a crashed process leaves behind.
#[derive(Debug)]
pub struct Allocator {
    dir: PathBuf,
    prefix: String,
    pid: u32,
    owned: Mutex<BTreeSet<String>>,
}

impl Allocator {
    /// Create an allocator for the configured namespace.
    pub fn new(config: &ShmConfig) -> Result<Self> {
        validate_prefix(&config.prefix)?;
        Ok(Self {
            dir: config.dir.clone(),
            prefix: config.prefix.clone(),
            pid: std::process::id(),
            owned: Mutex::new(BTreeSet::new()),
        })
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Namespace prefix used for generated names.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Allocate a zeroed array under a freshly generated name.
    pub fn create(&self, shape: &[usize], dtype: DType) -> Result<SharedArray> {
        let name = SegmentName::generate(&self.prefix, self.pid)?;
        self.create_named(shape, dtype, &name.to_string())
    }

    /// Allocate a zeroed array under an explicit name.
    ///
    /// Fails with [`Error::SegmentExists`] if the name is taken.
    pub fn create_named(&self, shape: &[usize], dtype: DType, name: &str) -> Result<SharedArray> {
        let array = SharedArray::create(&self.dir, name, shape, dtype)?;
        self.record().insert(array.name().to_string());
        Ok(array)
    }

    /// Map an existing segment without taking ownership of it.
    pub fn attach(&self, name: &str, shape: &[usize], dtype: DType) -> Result<SharedArray> {
        SharedArray::attach(&self.dir, name, shape, dtype)
    }

    /// Record `array` as owned by this process so it can be freed here.
    pub fn take_ownership(&self, array: &SharedArray) {
        self.record().insert(array.name().to_string());
    }

    /// Whether this process owns the named segment.
    pub fn is_owned(&self, name: &str) -> bool {
        self.record().contains(name)
    }

    /// Names of all owned segments.
    pub fn owned_names(&self) -> Vec<String> {
        self.record().iter().cloned().collect()
    }

    /// Remove `array` from the namespace and unmap it.
    ///
    /// Freeing a segment that is not owned (including one already freed)
    /// returns [`Error::SegmentNotOwned`] and changes nothing.
    pub fn free(&self, array: SharedArray) -> Result<()> {
        self.free_by_name(array.name())
    }

    /// Remove an owned segment by name.
    pub fn free_by_name(&self, name: &str) -> Result<()> {
        let mut owned = self.record();
        if !owned.contains(name) {
            return Err(Error::SegmentNotOwned(name.to_string()));
        }
        match std::fs::remove_file(self.dir.join(name)) {
            Ok(()) => {}
            // Someone else already removed it; ownership is moot.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(segment = name, "owned segment already gone");
            }
            Err(e) => return Err(e.into()),
        }
        owned.remove(name);
        tracing::debug!(segment = name, "freed shared array");
        Ok(())
    }

    /// Free every segment this process owns. Returns how many were freed.
    ///
    /// Individual failures are logged and the segment stays in the record.
    pub fn free_all_owned(&self) -> usize {
        let names = self.owned_names();
        let mut freed = 0;
        for name in names {
            match self.free_by_name(&name) {
                Ok(()) => freed += 1,
                Err(e) => tracing::warn!(segment = %name, error = %e, "failed to free owned segment"),
            }
        }
        if freed > 0 {
            tracing::info!(freed, "freed all owned shared memory");
        }
        freed
    }

    fn record(&self) -> MutexGuard<'_, BTreeSet<String>> {
        // The set stays consistent even if a holder panicked.
        self.owned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
