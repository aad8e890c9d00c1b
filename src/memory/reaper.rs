//! Reclaiming shared memory left behind by dead processes.
//!
//! Segments outlive the process that created them. When a run crashes its
//! segments stay in `/dev/shm` until somebody removes them. The reaper
//! scans the namespace for segments carrying our prefix whose encoded pid no
//! longer exists and removes them.
//!
//! # Safety policy
//!
//! - Names that do not decode as `{prefix}_{pid}_{token}` are never touched.
//! - Segments modified at or after this process started are skipped, so a
//!   peer that started later and is still creating its segments is not
//!   raced. This is a timestamp heuristic, not a guarantee.
//! - A pid that exists but cannot be signalled belongs to another user and
//!   is alive; its segments stay.
//! - Liveness checks race with process exit. Failures to remove are logged
//!   and skipped.

use super::liveness::{ProcessProbe, ProcessStatus, SystemProbe, process_start_time};
use super::name::{SegmentName, validate_prefix};
use crate::config::ShmConfig;
use crate::error::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Outcome of a reclamation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Segments removed.
    pub freed: Vec<SegmentName>,
    /// Segments that could not be removed.
    pub failed: Vec<SegmentName>,
}

impl ReclaimReport {
    /// Number of segments removed.
    pub fn freed_count(&self) -> usize {
        self.freed.len()
    }
}

/// Scans the shared memory namespace for orphaned segments.
#[derive(Debug)]
pub struct Reaper<P = SystemProbe> {
    dir: PathBuf,
    prefix: String,
    pid: u32,
    process_start: SystemTime,
    probe: P,
}

impl Reaper<SystemProbe> {
    /// Create a reaper for the configured namespace using real process
    /// lookups.
    pub fn new(config: &ShmConfig) -> Result<Self> {
        validate_prefix(&config.prefix)?;
        let process_start = process_start_time().unwrap_or_else(|| {
            tracing::warn!("process start time unavailable, using reaper creation time");
            SystemTime::now()
        });
        Ok(Self {
            dir: config.dir.clone(),
            prefix: config.prefix.clone(),
            pid: std::process::id(),
            process_start,
            probe: SystemProbe,
        })
    }
}

impl<P: ProcessProbe> Reaper<P> {
    /// Replace the process probe.
    pub fn with_probe<Q: ProcessProbe>(self, probe: Q) -> Reaper<Q> {
        Reaper {
            dir: self.dir,
            prefix: self.prefix,
            pid: self.pid,
            process_start: self.process_start,
            probe,
        }
    }

    /// Override the reference start time used to skip young segments.
    pub fn with_process_start(mut self, start: SystemTime) -> Self {
        self.process_start = start;
        self
    }

    /// Directory being scanned.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segments in the namespace that are safe to remove.
    pub fn find_orphaned_segments(&self) -> Result<Vec<SegmentName>> {
        let mut orphans = Vec::new();

        for (name, path) in self.our_segments()? {
            let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t,
                // Removed while we were scanning.
                Err(_) => continue,
            };
            if modified >= self.process_start {
                tracing::trace!(segment = %name, "skipping segment newer than this process");
                continue;
            }

            match self.probe.status(name.pid()) {
                ProcessStatus::Missing => orphans.push(name),
                ProcessStatus::Alive | ProcessStatus::AccessDenied => {
                    tracing::trace!(segment = %name, pid = name.pid(), "owner still running");
                }
            }
        }

        Ok(orphans)
    }

    /// Remove the given segments. Only pass names vetted by
    /// [`find_orphaned_segments`](Self::find_orphaned_segments).
    pub fn reclaim(&self, names: &[SegmentName]) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        for name in names {
            if name.prefix() != self.prefix {
                tracing::warn!(segment = %name, "refusing to reclaim segment outside our namespace");
                continue;
            }
            match std::fs::remove_file(self.dir.join(name.to_string())) {
                Ok(()) => {
                    tracing::debug!(segment = %name, "reclaimed segment");
                    report.freed.push(name.clone());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(segment = %name, "segment vanished before reclaim");
                }
                Err(e) => {
                    tracing::warn!(segment = %name, error = %e, "failed to reclaim segment");
                    report.failed.push(name.clone());
                }
            }
        }

        report
    }

    /// Find and remove every orphaned segment.
    pub fn reclaim_orphans(&self) -> Result<ReclaimReport> {
        let orphans = self.find_orphaned_segments()?;
        let report = self.reclaim(&orphans);
        if report.freed_count() > 0 {
            tracing::info!(
                freed = report.freed_count(),
                failed = report.failed.len(),
                "reclaimed shared memory from previous processes"
            );
        }
        Ok(report)
    }

    /// Remove every segment whose encoded pid is this process, owned or not.
    ///
    /// Covers segments from a crashed earlier run that happened to have the
    /// same pid, and anything that fell out of the ownership record.
    pub fn clear_memory_owned_by_current_process(&self) -> Result<ReclaimReport> {
        let mine: Vec<SegmentName> = self
            .our_segments()?
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| name.pid() == self.pid)
            .collect();
        Ok(self.reclaim(&mine))
    }

    /// Every entry in the directory that decodes as one of our names.
    fn our_segments(&self) -> Result<Vec<(SegmentName, PathBuf)>> {
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = SegmentName::parse_with_prefix(file_name, &self.prefix) {
                segments.push((name, entry.path()));
            }
        }
        segments.sort();
        Ok(segments)
    }
}
