//! Progress reporting.

/// Receives progress as items complete.
///
/// Each call advances the count by `steps` for the operation named `label`.
pub trait ProgressReporter {
    /// Record `steps` more completed items.
    fn update(&mut self, steps: usize, label: &str);
}

impl<F: FnMut(usize, &str)> ProgressReporter for F {
    fn update(&mut self, steps: usize, label: &str) {
        self(steps, label)
    }
}

/// Discards progress.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn update(&mut self, _steps: usize, _label: &str) {}
}

/// Logs progress through `tracing` every tenth of the total.
#[derive(Debug)]
pub struct LoggingProgress {
    total: usize,
    done: usize,
    next_decile: usize,
}

impl LoggingProgress {
    /// Reporter expecting `total` items.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            done: 0,
            next_decile: 1,
        }
    }

    /// Items seen so far.
    pub fn done(&self) -> usize {
        self.done
    }
}

impl ProgressReporter for LoggingProgress {
    fn update(&mut self, steps: usize, label: &str) {
        self.done += steps;
        if self.total == 0 {
            return;
        }
        let decile = self.done.min(self.total) * 10 / self.total;
        if decile >= self.next_decile {
            self.next_decile = decile + 1;
            tracing::info!(
                label,
                done = self.done,
                total = self.total,
                "{}% complete",
                decile * 10
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_reporter() {
        let mut seen = Vec::new();
        {
            let mut reporter = |steps: usize, label: &str| seen.push((steps, label.to_string()));
            reporter.update(1, "Loading");
            reporter.update(2, "Loading");
        }
        assert_eq!(seen, vec![(1, "Loading".into()), (2, "Loading".into())]);
    }

    #[test]
    fn test_logging_progress_counts() {
        let mut progress = LoggingProgress::new(20);
        for _ in 0..20 {
            progress.update(1, "Scale");
        }
        assert_eq!(progress.done(), 20);
        assert_eq!(progress.next_decile, 11);
    }

    #[test]
    fn test_logging_progress_empty_total() {
        let mut progress = LoggingProgress::new(0);
        progress.update(1, "noop");
        assert_eq!(progress.done(), 1);
    }
}
