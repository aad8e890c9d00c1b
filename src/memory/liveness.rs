//! Process liveness checks and process start time.
//!
//! Both are best effort: a process can exit right after it was observed
//! alive, and pids get recycled.

use rustix::io::Errno;
use rustix::process::Pid;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What a liveness probe learned about a pid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The process exists and we may signal it.
    Alive,
    /// The process exists but belongs to someone else.
    AccessDenied,
    /// No such process.
    Missing,
}

/// Looks up whether a process exists.
pub trait ProcessProbe {
    /// Status of `pid`.
    fn status(&self, pid: u32) -> ProcessStatus;
}

/// Probe backed by `kill(pid, 0)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn status(&self, pid: u32) -> ProcessStatus {
        // pid 0 would address our own process group.
        let Some(target) = i32::try_from(pid).ok().and_then(Pid::from_raw) else {
            return ProcessStatus::Missing;
        };
        match rustix::process::test_kill_process(target) {
            Ok(()) => ProcessStatus::Alive,
            Err(Errno::SRCH) => ProcessStatus::Missing,
            Err(Errno::PERM) => ProcessStatus::AccessDenied,
            Err(e) => {
                tracing::debug!(pid, error = %e, "unexpected liveness error, assuming alive");
                ProcessStatus::AccessDenied
            }
        }
    }
}

/// Wall-clock start time of the current process.
///
/// Read from procfs; `None` where that is unavailable.
pub fn process_start_time() -> Option<SystemTime> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let boot = std::fs::read_to_string("/proc/stat").ok()?;
    let ticks = rustix::param::clock_ticks_per_second();
    parse_start_time(&stat, &boot, ticks)
}

fn parse_start_time(stat: &str, boot: &str, ticks_per_second: u64) -> Option<SystemTime> {
    // The command name is parenthesised and may itself contain spaces or
    // parentheses, so fields are counted from the last ')'. `starttime` is
    // field 22 overall, i.e. the 20th after the name.
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let start_ticks: u64 = after_comm.split_whitespace().nth(19)?.parse().ok()?;

    let btime: u64 = boot
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    if ticks_per_second == 0 {
        return None;
    }
    let since_boot = Duration::from_secs_f64(start_ticks as f64 / ticks_per_second as f64);
    Some(UNIX_EPOCH + Duration::from_secs(btime) + since_boot)
}
