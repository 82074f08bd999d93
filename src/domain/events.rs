//! Study events broadcast to observers
//!
//! Besides the synchronous orchestrator hooks, state changes are mirrored on
//! a bounded broadcast channel. Slow or absent observers lose old events;
//! they never block the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::ErrorCode;
use crate::domain::study::{StudyProgress, StudyStatus};

/// State-change notifications emitted during a study run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StudyEvent {
    StudyTransition {
        study_id: String,
        from: StudyStatus,
        to: StudyStatus,
        timestamp: DateTime<Utc>,
    },
    StudyPaused {
        study_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    StudyResumed {
        study_id: String,
        timestamp: DateTime<Utc>,
    },
    JobStarted {
        study_id: String,
        job_id: String,
        cell_key: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    JobCompleted {
        study_id: String,
        job_id: String,
        cell_key: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    JobFailed {
        study_id: String,
        job_id: String,
        cell_key: String,
        error_code: ErrorCode,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    ProgressUpdated {
        study_id: String,
        progress: StudyProgress,
        timestamp: DateTime<Utc>,
    },
    CheckpointSaved {
        study_id: String,
        sequence_number: u64,
        completed_cells: u64,
        timestamp: DateTime<Utc>,
    },
    DeadlineAtRisk {
        study_id: String,
        deadline: DateTime<Utc>,
        projected_completion: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    StudyCompleted {
        study_id: String,
        status: StudyStatus,
        timestamp: DateTime<Utc>,
    },
}

impl StudyEvent {
    pub fn study_id(&self) -> &str {
        match self {
            Self::StudyTransition { study_id, .. }
            | Self::StudyPaused { study_id, .. }
            | Self::StudyResumed { study_id, .. }
            | Self::JobStarted { study_id, .. }
            | Self::JobCompleted { study_id, .. }
            | Self::JobFailed { study_id, .. }
            | Self::ProgressUpdated { study_id, .. }
            | Self::CheckpointSaved { study_id, .. }
            | Self::DeadlineAtRisk { study_id, .. }
            | Self::StudyCompleted { study_id, .. } => study_id,
        }
    }
}
