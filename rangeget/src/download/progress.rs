//! Progress reporting without event storms.
//!
//! Connections report every write. The tracker turns that stream into one
//! [`Progress`] per whole percent (or per MiB while the size is unknown).

/// Step used while the total size is unknown.
const UNKNOWN_SIZE_STEP: u64 = 1024 * 1024;

/// Snapshot of overall progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Bytes written so far, including bytes restored from a manifest.
    pub completed: u64,
    /// Total size, `None` while unknown.
    pub total: Option<u64>,
    /// Completion in percent, `None` while the size is unknown.
    pub percent: Option<f64>,
}

impl Progress {
    pub fn new(completed: u64, total: Option<u64>) -> Self {
        let percent = total.map(|total| {
            if total == 0 {
                100.0
            } else {
                completed as f64 / total as f64 * 100.0
            }
        });
        Self {
            completed,
            total,
            percent,
        }
    }
}

/// Emits progress only when the reported value changes.
#[derive(Debug, Default)]
pub(crate) struct ProgressTracker {
    last: Option<u64>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a [`Progress`] if it differs from the last one reported.
    pub fn update(&mut self, completed: u64, total: Option<u64>) -> Option<Progress> {
        let key = match total {
            Some(0) => 100,
            Some(total) => (u128::from(completed) * 100 / u128::from(total)) as u64,
            None => completed / UNKNOWN_SIZE_STEP,
        };
        if self.last == Some(key) {
            return None;
        }
        self.last = Some(key);
        Some(Progress::new(completed, total))
    }

    /// Whether 100% has been reported.
    pub fn reported_complete(&self, total: Option<u64>) -> bool {
        total.is_some() && self.last == Some(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_only_whole_percent_changes() {
        let mut tracker = ProgressTracker::new();
        let first = tracker.update(0, Some(1000)).unwrap();
        assert_eq!(first.percent, Some(0.0));

        assert!(tracker.update(5, Some(1000)).is_none());
        assert!(tracker.update(9, Some(1000)).is_none());

        let next = tracker.update(10, Some(1000)).unwrap();
        assert_eq!(next.completed, 10);
        assert_eq!(next.percent, Some(1.0));

        assert!(!tracker.reported_complete(Some(1000)));
        tracker.update(1000, Some(1000)).unwrap();
        assert!(tracker.reported_complete(Some(1000)));
    }

    #[test]
    fn test_unknown_size_reports_per_mib() {
        let mut tracker = ProgressTracker::new();
        assert!(tracker.update(10, None).is_some());
        assert!(tracker.update(UNKNOWN_SIZE_STEP - 1, None).is_none());
        let progress = tracker.update(UNKNOWN_SIZE_STEP, None).unwrap();
        assert_eq!(progress.percent, None);
        assert_eq!(progress.total, None);
    }

    #[test]
    fn test_empty_resource_is_complete() {
        let progress = Progress::new(0, Some(0));
        assert_eq!(progress.percent, Some(100.0));
    }
}
