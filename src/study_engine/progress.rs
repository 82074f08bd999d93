//! Progress rate and deadline tracking
//!
//! The rate is computed over a trailing window of terminal-cell timestamps.
//! Deadline risk is edge-triggered: the at-risk hook fires once per
//! false->true flip and re-arms if the projection recovers.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::study::{DeadlineStatus, StudyProgress};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineConfig {
    /// Subtracted from the deadline when judging risk. Zero by default.
    #[serde(default)]
    pub safety_margin_secs: u64,
    /// Trailing window the rate is measured over.
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,
}

fn default_rate_window() -> u64 {
    600
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: 0,
            rate_window_secs: default_rate_window(),
        }
    }
}

/// Per-study rate window plus deadline risk edge detection.
#[derive(Debug)]
pub struct ProgressTracker {
    config: DeadlineConfig,
    terminal_events: VecDeque<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    at_risk: bool,
}

impl ProgressTracker {
    pub fn new(config: DeadlineConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            config,
            terminal_events: VecDeque::new(),
            started_at,
            at_risk: false,
        }
    }

    /// Record one cell reaching a terminal state.
    pub fn record_terminal(&mut self, at: DateTime<Utc>) {
        self.terminal_events.push_back(at);
        self.prune(at);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::seconds(self.config.rate_window_secs as i64);
        while self
            .terminal_events
            .front()
            .is_some_and(|t| *t < horizon)
        {
            self.terminal_events.pop_front();
        }
    }

    /// Terminal cells per hour over the trailing window.
    pub fn rate_per_hour(&mut self, now: DateTime<Utc>) -> f64 {
        self.prune(now);
        if self.terminal_events.is_empty() {
            return 0.0;
        }
        // Use the elapsed slice of the window when the run is younger than it.
        let window_start =
            (now - Duration::seconds(self.config.rate_window_secs as i64)).max(self.started_at);
        let elapsed_secs = (now - window_start).num_milliseconds() as f64 / 1000.0;
        if elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.terminal_events.len() as f64 * 3600.0 / elapsed_secs
    }

    /// Update progress rate and deadline projection. Returns true exactly
    /// when at-risk flips from false to true.
    pub fn update(
        &mut self,
        progress: &mut StudyProgress,
        deadline_status: &mut DeadlineStatus,
        now: DateTime<Utc>,
    ) -> bool {
        progress.rate_per_hour = self.rate_per_hour(now);

        let Some(deadline) = deadline_status.deadline else {
            return false;
        };

        let remaining = progress.total_cells
            - progress.completed_cells.min(progress.total_cells)
            - progress.failed_cells.min(progress.total_cells);
        let projected = if remaining == 0 {
            Some(now)
        } else if progress.rate_per_hour > 0.0 {
            let secs = remaining as f64 * 3600.0 / progress.rate_per_hour;
            Some(now + Duration::milliseconds((secs * 1000.0) as i64))
        } else {
            None
        };
        deadline_status.projected_completion = projected;

        let cutoff = deadline - Duration::seconds(self.config.safety_margin_secs as i64);
        let risky = match projected {
            Some(projection) => projection > cutoff,
            // No rate yet: risky only once the cutoff itself has passed.
            None => now > cutoff,
        };

        let flipped = risky && !self.at_risk;
        if self.at_risk != risky {
            self.at_risk = risky;
        }
        deadline_status.at_risk = risky;
        flipped
    }

    pub fn is_at_risk(&self) -> bool {
        self.at_risk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(total: u64, completed: u64) -> StudyProgress {
        StudyProgress {
            total_cells: total,
            executing_cells: 0,
            completed_cells: completed,
            failed_cells: 0,
            completion_percentage: 0.0,
            rate_per_hour: 0.0,
        }
    }

    #[test]
    fn rate_reflects_trailing_window() {
        let start = Utc::now();
        let mut tracker = ProgressTracker::new(
            DeadlineConfig {
                safety_margin_secs: 0,
                rate_window_secs: 60,
            },
            start,
        );
        for i in 0..6 {
            tracker.record_terminal(start + Duration::seconds(i * 10));
        }
        let now = start + Duration::seconds(60);
        // 6 cells in 60s -> 360/hour
        let rate = tracker.rate_per_hour(now);
        assert!((rate - 360.0).abs() < 1.0, "rate {rate}");
    }

    #[test]
    fn at_risk_fires_once_and_rearms() {
        let start = Utc::now();
        let mut tracker = ProgressTracker::new(DeadlineConfig::default(), start);
        let mut prog = progress(100, 1);
        let mut deadline = DeadlineStatus {
            deadline: Some(start + Duration::seconds(60)),
            at_risk: false,
            projected_completion: None,
        };

        // One terminal cell in 10s -> 99 remaining at ~6/min -> way past deadline.
        tracker.record_terminal(start + Duration::seconds(10));
        let flipped = tracker.update(&mut prog, &mut deadline, start + Duration::seconds(10));
        assert!(flipped);
        assert!(deadline.at_risk);

        // Still risky: no second edge.
        let flipped = tracker.update(&mut prog, &mut deadline, start + Duration::seconds(11));
        assert!(!flipped);
        assert!(deadline.at_risk);

        // Nearly done: projection lands before the deadline, risk clears...
        prog.completed_cells = 99;
        for i in 0..20 {
            tracker.record_terminal(start + Duration::seconds(12 + i));
        }
        let flipped = tracker.update(&mut prog, &mut deadline, start + Duration::seconds(32));
        assert!(!flipped);
        assert!(!deadline.at_risk);

        // ...and a later collapse can trigger a second edge.
        prog.completed_cells = 99;
        prog.total_cells = 1000;
        let flipped = tracker.update(&mut prog, &mut deadline, start + Duration::seconds(33));
        assert!(flipped);
    }

    #[test]
    fn no_deadline_means_no_risk() {
        let start = Utc::now();
        let mut tracker = ProgressTracker::new(DeadlineConfig::default(), start);
        let mut prog = progress(10, 0);
        let mut deadline = DeadlineStatus::default();
        assert!(!tracker.update(&mut prog, &mut deadline, start));
        assert!(!deadline.at_risk);
    }

    #[test]
    fn safety_margin_moves_the_cutoff() {
        let start = Utc::now();
        let mut tracker = ProgressTracker::new(
            DeadlineConfig {
                safety_margin_secs: 3600,
                rate_window_secs: 600,
            },
            start,
        );
        let mut prog = progress(10, 5);
        let mut deadline = DeadlineStatus {
            deadline: Some(start + Duration::minutes(30)),
            at_risk: false,
            projected_completion: None,
        };
        // Margin exceeds time to deadline: cutoff already passed regardless of rate.
        tracker.record_terminal(start);
        let flipped = tracker.update(&mut prog, &mut deadline, start + Duration::seconds(1));
        assert!(flipped);
    }
}
