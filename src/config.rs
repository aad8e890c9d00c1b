//! Configuration for the shared memory namespace, worker pool and engine.
//!
//! Every struct has sensible defaults and `with_*` builders.
//! [`Config::from_env`] overlays `TOMOPAR_*` environment variables on top of
//! the defaults:
//!
//! | Variable              | Field                   |
//! |-----------------------|-------------------------|
//! | `TOMOPAR_SHM_DIR`     | `shm.dir`               |
//! | `TOMOPAR_SHM_PREFIX`  | `shm.prefix`            |
//! | `TOMOPAR_WORKERS`     | `pool.workers`          |
//! | `TOMOPAR_WORKER_BIN`  | `pool.worker_program`   |
//! | `TOMOPAR_CHUNKSIZE`   | `engine.chunksize`      |

use crate::error::{Error, Result};
use crate::memory::DEFAULT_PREFIX;
use std::path::PathBuf;

/// Directory backing POSIX shared memory on Linux.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// File name of the worker executable.
pub const WORKER_PROGRAM_NAME: &str = "tomopar-worker";

/// Shared memory namespace settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShmConfig {
    /// Directory where segments live.
    pub dir: PathBuf,
    /// Prefix of every segment name this crate creates.
    pub prefix: String,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_SHM_DIR),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl ShmConfig {
    /// Use a different segment directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Use a different name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Worker pool settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker processes. `None` means one per CPU.
    pub workers: Option<usize>,
    /// Worker executable. `None` looks for `tomopar-worker` next to the
    /// current executable.
    pub worker_program: Option<PathBuf>,
}

impl PoolConfig {
    /// Fix the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Use an explicit worker executable.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Resolve the worker executable path.
    pub fn resolve_worker_program(&self) -> Result<PathBuf> {
        if let Some(program) = &self.worker_program {
            return Ok(program.clone());
        }

        let exe = std::env::current_exe()?;
        // Test and bench binaries live one level below the target dir.
        exe.ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(WORKER_PROGRAM_NAME))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                Error::WorkerSpawn(format!(
                    "{WORKER_PROGRAM_NAME} not found next to {}",
                    exe.display()
                ))
            })
    }
}

/// Parallel execution settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Items per dispatched chunk. `None` uses the default policy.
    pub chunksize: Option<usize>,
}

impl EngineConfig {
    /// Fix the chunk size.
    pub fn with_chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = Some(chunksize);
        self
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Shared memory namespace.
    pub shm: ShmConfig,
    /// Worker pool.
    pub pool: PoolConfig,
    /// Parallel execution engine.
    pub engine: EngineConfig,
}

impl Config {
    /// Defaults overlaid with `TOMOPAR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup("TOMOPAR_SHM_DIR") {
            self.shm.dir = PathBuf::from(dir);
        }
        if let Some(prefix) = lookup("TOMOPAR_SHM_PREFIX") {
            crate::memory::validate_prefix(&prefix)?;
            self.shm.prefix = prefix;
        }
        if let Some(workers) = lookup("TOMOPAR_WORKERS") {
            self.pool.workers = Some(parse_positive("TOMOPAR_WORKERS", &workers)?);
        }
        if let Some(program) = lookup("TOMOPAR_WORKER_BIN") {
            self.pool.worker_program = Some(PathBuf::from(program));
        }
        if let Some(chunksize) = lookup("TOMOPAR_CHUNKSIZE") {
            self.engine.chunksize = Some(parse_positive("TOMOPAR_CHUNKSIZE", &chunksize)?);
        }
        Ok(self)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!("{key}={value:?} must be a positive integer"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.shm.dir, PathBuf::from("/dev/shm"));
        assert_eq!(config.shm.prefix, "TP");
        assert!(config.pool.workers.is_none());
        assert!(config.pool.worker_count() >= 1);
        assert!(config.engine.chunksize.is_none());
    }

    #[test]
    fn test_overlay() {
        let config = Config::default()
            .overlay(env(&[
                ("TOMOPAR_SHM_DIR", "/tmp/shm"),
                ("TOMOPAR_SHM_PREFIX", "XY"),
                ("TOMOPAR_WORKERS", "3"),
                ("TOMOPAR_WORKER_BIN", "/opt/bin/tomopar-worker"),
                ("TOMOPAR_CHUNKSIZE", "8"),
            ]))
            .unwrap();
        assert_eq!(config.shm.dir, PathBuf::from("/tmp/shm"));
        assert_eq!(config.shm.prefix, "XY");
        assert_eq!(config.pool.worker_count(), 3);
        assert_eq!(
            config.pool.resolve_worker_program().unwrap(),
            PathBuf::from("/opt/bin/tomopar-worker")
        );
        assert_eq!(config.engine.chunksize, Some(8));
    }

    #[test]
    fn test_overlay_rejects_bad_values() {
        for pairs in [
            [("TOMOPAR_WORKERS", "0")],
            [("TOMOPAR_WORKERS", "many")],
            [("TOMOPAR_CHUNKSIZE", "-1")],
            [("TOMOPAR_SHM_PREFIX", "A_B")],
        ] {
            let result = Config::default().overlay(env(&pairs));
            assert!(matches!(result, Err(Error::Config(_))), "{pairs:?}");
        }
    }

    #[test]
    fn test_builders() {
        let shm = ShmConfig::default().with_dir("/run/shm").with_prefix("AB");
        assert_eq!(shm.dir, PathBuf::from("/run/shm"));
        assert_eq!(shm.prefix, "AB");
        assert_eq!(PoolConfig::default().with_workers(0).worker_count(), 1);
        assert_eq!(EngineConfig::default().with_chunksize(4).chunksize, Some(4));
    }
}
