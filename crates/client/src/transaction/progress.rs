//! Send and receive progress accounting.

/// One progress callback's worth of data.
///
/// `percent` is `0.0` whenever the total is unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub processed: u64,
    pub total: Option<u64>,
    pub percent: f64,
}

/// Decides which progress reports to emit for one direction of a transaction.
///
/// A 0% report always comes first and exactly once. With a known total a report is
/// emitted only when the percentage strictly grows, capped at 100; a zero total reports
/// 100% right after the 0%. With an unknown total every increase of `processed` is
/// reported.
#[derive(Debug, Default)]
pub(crate) struct ProgressTracker {
    total: Option<u64>,
    processed: u64,
    started: bool,
    last_percent: f64,
    last_processed: u64,
}

impl ProgressTracker {
    /// Switches to a new expected total, keeping what was already reported.
    pub(crate) fn expect(&mut self, total: Option<u64>) {
        self.total = total;
    }

    /// Starts counting over for a body sent again, without repeating earlier reports.
    pub(crate) fn restart(&mut self) {
        self.processed = 0;
        self.last_processed = 0;
    }

    pub(crate) fn add(&mut self, bytes: u64) {
        self.processed = self.processed.saturating_add(bytes);
    }

    pub(crate) fn reports(&mut self) -> [Option<Progress>; 2] {
        let first = (!self.started).then(|| {
            self.started = true;
            Progress { processed: 0, total: self.total, percent: 0.0 }
        });

        let next = match self.total {
            Some(total) => {
                let percent = percent_of(self.processed, total);
                (percent > self.last_percent).then(|| {
                    self.last_percent = percent;
                    Progress { processed: self.processed, total: Some(total), percent }
                })
            }
            None => (self.processed > self.last_processed).then(|| {
                self.last_processed = self.processed;
                Progress { processed: self.processed, total: None, percent: 0.0 }
            }),
        };

        [first, next]
    }
}

#[allow(clippy::cast_precision_loss, reason = "percentages do not need integer precision")]
fn percent_of(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (processed as f64 / total as f64 * 100.0).min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(tracker: &mut ProgressTracker) -> Vec<f64> {
        tracker.reports().into_iter().flatten().map(|progress| progress.percent).collect()
    }

    #[test]
    fn test_known_total() {
        let mut tracker = ProgressTracker::default();
        tracker.expect(Some(200));

        assert_eq!(collect(&mut tracker), vec![0.0]);
        tracker.add(50);
        assert_eq!(collect(&mut tracker), vec![25.0]);
        assert!(collect(&mut tracker).is_empty());
        tracker.add(150);
        assert_eq!(collect(&mut tracker), vec![100.0]);
        tracker.add(10);
        assert!(collect(&mut tracker).is_empty());
    }

    #[test]
    fn test_zero_total() {
        let mut tracker = ProgressTracker::default();
        tracker.expect(Some(0));
        assert_eq!(collect(&mut tracker), vec![0.0, 100.0]);
        assert!(collect(&mut tracker).is_empty());
    }

    #[test]
    fn test_unknown_total() {
        let mut tracker = ProgressTracker::default();
        let first = tracker.reports();
        assert_eq!(first[0], Some(Progress { processed: 0, total: None, percent: 0.0 }));
        assert_eq!(first[1], None);

        tracker.add(7);
        let reports: Vec<_> = tracker.reports().into_iter().flatten().collect();
        assert_eq!(reports, vec![Progress { processed: 7, total: None, percent: 0.0 }]);
    }

    #[test]
    fn test_restart_does_not_repeat() {
        let mut tracker = ProgressTracker::default();
        tracker.expect(Some(10));
        tracker.add(10);
        assert_eq!(collect(&mut tracker), vec![0.0, 100.0]);

        tracker.restart();
        tracker.add(5);
        assert!(collect(&mut tracker).is_empty());
        tracker.add(5);
        assert!(collect(&mut tracker).is_empty());
    }
}
