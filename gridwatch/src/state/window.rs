// gridwatch/src/state/window.rs
//
// Bounded-age window of timestamped values. Pruning is lazy: every public
// read first drops entries older than the horizon, so no background timer
// is needed. The running sum is maintained incrementally; min and max
// scan the survivors. Entries arrive in push order; the prune walks from
// the front, which is the oldest entry under the per-key ordering the log
// guarantees.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct TimeWindow {
    horizon_secs: i64,
    entries:      VecDeque<(DateTime<Utc>, f64)>,
    sum:          f64,
}

impl TimeWindow {
    pub fn new(horizon_secs: i64) -> Self {
        Self {
            horizon_secs,
            entries: VecDeque::new(),
            sum: 0.0,
        }
    }

    pub fn horizon_secs(&self) -> i64 {
        self.horizon_secs
    }

    /// Add a value; a missing timestamp means "now".
    pub fn add(&mut self, value: f64, timestamp: Option<DateTime<Utc>>) {
        let ts = timestamp.unwrap_or_else(Utc::now);
        self.entries.push_back((ts, value));
        self.sum += value;
        self.prune();
    }

    fn prune(&mut self) {
        let cutoff = Utc::now() - Duration::seconds(self.horizon_secs);
        while let Some(&(ts, value)) = self.entries.front() {
            if ts >= cutoff {
                break;
            }
            self.sum -= value;
            self.entries.pop_front();
        }
        if self.entries.is_empty() {
            self.sum = 0.0;
        }
    }

    pub fn count(&mut self) -> usize {
        self.prune();
        self.entries.len()
    }

    pub fn sum(&mut self) -> f64 {
        self.prune();
        self.sum
    }

    pub fn mean(&mut self) -> f64 {
        self.prune();
        if self.entries.is_empty() {
            0.0
        } else {
            self.sum / self.entries.len() as f64
        }
    }

    pub fn min(&mut self) -> f64 {
        self.prune();
        if self.entries.is_empty() {
            return 0.0;
        }
        self.entries.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min)
    }

    pub fn max(&mut self) -> f64 {
        self.prune();
        if self.entries.is_empty() {
            return 0.0;
        }
        self.entries.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    #[test]
    fn empty_window_reads_zero() {
        let mut w = TimeWindow::new(300);
        assert_eq!(w.count(), 0);
        assert_eq!(w.sum(), 0.0);
        assert_eq!(w.mean(), 0.0);
        assert_eq!(w.min(), 0.0);
        assert_eq!(w.max(), 0.0);
    }

    #[test]
    fn tracks_window_stats() {
        let mut w = TimeWindow::new(300);
        for v in [10.0, 20.0, 30.0] {
            w.add(v, None);
        }
        assert_eq!(w.count(), 3);
        assert!((w.sum() - 60.0).abs() < EPS);
        assert!((w.mean() - 20.0).abs() < EPS);
        assert_eq!(w.min(), 10.0);
        assert_eq!(w.max(), 30.0);
    }

    #[test]
    fn expires_entries_past_the_horizon() {
        let horizon = 300;
        let mut w = TimeWindow::new(horizon);
        w.add(100.0, Some(Utc::now() - Duration::seconds(2 * horizon)));
        w.add(5.0, Some(Utc::now()));
        assert_eq!(w.count(), 1);
        assert!((w.sum() - 5.0).abs() < EPS);
        assert_eq!(w.min(), 5.0);
        assert_eq!(w.max(), 5.0);
    }

    #[test]
    fn fully_expired_window_reads_zero() {
        let mut w = TimeWindow::new(60);
        w.add(7.0, Some(Utc::now() - Duration::seconds(120)));
        assert_eq!(w.count(), 0);
        assert_eq!(w.sum(), 0.0);
    }
}
