//! Study - a manifest in execution
//!
//! The status state machine is a fixed transition table; every transition not
//! listed is rejected with an error rather than silently ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::manifest::ValidatedManifest;

/// Study lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyStatus {
    ManifestReceived,
    Validating,
    Queued,
    Executing,
    Paused,
    ValidatingResults,
    Complete,
    Failed,
}

impl StudyStatus {
    /// The fixed transition table. Anything not listed here is illegal.
    pub fn can_transition_to(self, next: StudyStatus) -> bool {
        use StudyStatus::*;
        matches!(
            (self, next),
            (ManifestReceived, Validating)
                | (Validating, Queued)
                | (Validating, Failed)
                | (Queued, Executing)
                | (Executing, Paused)
                | (Paused, Executing)
                | (Executing, ValidatingResults)
                | (Executing, Failed)
                | (ValidatingResults, Complete)
                | (ValidatingResults, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Executing | Self::Paused | Self::ValidatingResults)
    }
}

impl std::fmt::Display for StudyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ManifestReceived => "manifest_received",
            Self::Validating => "validating",
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::ValidatingResults => "validating_results",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal study transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: StudyStatus,
    pub to: StudyStatus,
}

/// Live progress counters. The conservation invariant
/// `executing + completed + failed + pending == total` holds after every
/// public engine operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyProgress {
    pub total_cells: u64,
    pub executing_cells: u64,
    pub completed_cells: u64,
    pub failed_cells: u64,
    pub completion_percentage: f64,
    /// Terminal cells per hour over the trailing window.
    pub rate_per_hour: f64,
}

impl StudyProgress {
    pub fn pending_cells(&self) -> u64 {
        self.total_cells
            .saturating_sub(self.executing_cells + self.completed_cells + self.failed_cells)
    }

    pub fn terminal_cells(&self) -> u64 {
        self.completed_cells + self.failed_cells
    }

    pub fn recompute_percentage(&mut self) {
        self.completion_percentage = if self.total_cells == 0 {
            100.0
        } else {
            (self.terminal_cells() as f64 / self.total_cells as f64) * 100.0
        };
    }
}

/// Deadline tracking derived from current progress rate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadlineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub at_risk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projected_completion: Option<DateTime<Utc>>,
}

/// Accrued spend for a study.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyCosts {
    pub total_usd: f64,
    pub proxy_usd: f64,
    pub surface_usd: f64,
}

/// A manifest in execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub manifest: ValidatedManifest,
    pub status: StudyStatus,
    pub progress: StudyProgress,
    pub costs: StudyCosts,
    pub deadline_status: DeadlineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Study {
    pub fn new(manifest: ValidatedManifest, now: DateTime<Utc>) -> Self {
        let total_cells = manifest.total_cells() as u64;
        let deadline = manifest.deadline;
        let mut progress = StudyProgress {
            total_cells,
            ..StudyProgress::default()
        };
        progress.recompute_percentage();

        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: manifest.tenant_id.clone(),
            name: manifest.name.clone(),
            manifest,
            status: StudyStatus::ManifestReceived,
            progress,
            costs: StudyCosts::default(),
            deadline_status: DeadlineStatus {
                deadline,
                at_risk: false,
                projected_completion: None,
            },
            pause_reason: None,
            failure_reason: None,
            last_checkpoint_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transition, enforcing the table.
    pub fn transition(
        &mut self,
        to: StudyStatus,
        now: DateTime<Utc>,
    ) -> Result<StudyStatus, IllegalTransition> {
        if !self.status.can_transition_to(to) {
            return Err(IllegalTransition {
                from: self.status,
                to,
            });
        }
        let from = self.status;
        self.status = to;
        self.updated_at = now;
        if to != StudyStatus::Paused {
            self.pause_reason = None;
        }
        Ok(from)
    }
}

/// Final report produced when a study reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyRunSummary {
    pub study_id: String,
    pub study_name: String,
    pub status: StudyStatus,
    pub total_cells: u64,
    pub completed_cells: u64,
    pub failed_cells: u64,
    pub total_retries: u64,
    pub wall_clock_seconds: i64,
    /// Completion rate per required surface id.
    pub surface_completion: std::collections::HashMap<String, f64>,
    /// Count of terminal failures per error code string.
    pub failure_histogram: std::collections::HashMap<String, u64>,
    pub costs: StudyCosts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_is_exact() {
        use StudyStatus::*;

        let legal = [
            (ManifestReceived, Validating),
            (Validating, Queued),
            (Validating, Failed),
            (Queued, Executing),
            (Executing, Paused),
            (Paused, Executing),
            (Executing, ValidatingResults),
            (Executing, Failed),
            (ValidatingResults, Complete),
            (ValidatingResults, Failed),
        ];
        let all = [
            ManifestReceived,
            Validating,
            Queued,
            Executing,
            Paused,
            ValidatingResults,
            Complete,
            Failed,
        ];

        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn illegal_transition_is_an_error_not_a_noop() {
        use crate::domain::manifest::{self, ValidatedManifest};

        let manifest: manifest::StudyManifest = serde_json::from_value(serde_json::json!({
            "name": "t",
            "tenant_id": "t1",
            "queries": [{"text": "q"}],
            "surfaces": [{"id": "s", "required": true}],
            "locations": [{"id": "l", "proxy_type": "datacenter"}],
            "completion_criteria": {
                "required_surface_ids": ["s"],
                "coverage_threshold": 1.0
            }
        }))
        .unwrap();
        let mut study = Study::new(ValidatedManifest::assume_valid(manifest), Utc::now());

        let err = study.transition(StudyStatus::Complete, Utc::now()).unwrap_err();
        assert_eq!(err.from, StudyStatus::ManifestReceived);
        assert_eq!(err.to, StudyStatus::Complete);
        assert_eq!(study.status, StudyStatus::ManifestReceived);
    }

    #[test]
    fn progress_conservation_accessors() {
        let progress = StudyProgress {
            total_cells: 10,
            executing_cells: 2,
            completed_cells: 3,
            failed_cells: 1,
            completion_percentage: 0.0,
            rate_per_hour: 0.0,
        };
        assert_eq!(progress.pending_cells(), 4);
        assert_eq!(progress.terminal_cells(), 4);
    }
}
