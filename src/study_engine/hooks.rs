//! Orchestrator observer hooks
//!
//! Explicit function-value fields instead of a global event bus: fan-out is
//! predictable and each hook is independently optional. A panicking hook is
//! caught and logged; it must never corrupt engine state.

use std::panic::AssertUnwindSafe;

use tracing::error;

use crate::domain::error::ErrorCode;
use crate::domain::job::Job;
use crate::domain::study::{Study, StudyStatus};
use crate::infrastructure::checkpoint::Checkpoint;

type TransitionHook = Box<dyn Fn(StudyStatus, StudyStatus, &Study) + Send + Sync>;
type JobHook = Box<dyn Fn(&Job) + Send + Sync>;
type JobFailHook = Box<dyn Fn(&Job, ErrorCode) + Send + Sync>;
type StudyHook = Box<dyn Fn(&Study) + Send + Sync>;
type CheckpointHook = Box<dyn Fn(&Checkpoint) + Send + Sync>;

/// Optional synchronous callbacks observing the study lifecycle.
#[derive(Default)]
pub struct OrchestratorHooks {
    pub on_study_transition: Option<TransitionHook>,
    pub on_job_start: Option<JobHook>,
    pub on_job_complete: Option<JobHook>,
    pub on_job_fail: Option<JobFailHook>,
    pub on_deadline_at_risk: Option<StudyHook>,
    pub on_checkpoint_created: Option<CheckpointHook>,
}

impl std::fmt::Debug for OrchestratorHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorHooks")
            .field("on_study_transition", &self.on_study_transition.is_some())
            .field("on_job_start", &self.on_job_start.is_some())
            .field("on_job_complete", &self.on_job_complete.is_some())
            .field("on_job_fail", &self.on_job_fail.is_some())
            .field("on_deadline_at_risk", &self.on_deadline_at_risk.is_some())
            .field(
                "on_checkpoint_created",
                &self.on_checkpoint_created.is_some(),
            )
            .finish()
    }
}

fn guard(name: &str, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(hook = name, "observer hook panicked; engine state unaffected");
    }
}

impl OrchestratorHooks {
    pub fn study_transition(&self, from: StudyStatus, to: StudyStatus, study: &Study) {
        if let Some(hook) = &self.on_study_transition {
            guard("on_study_transition", || hook(from, to, study));
        }
    }

    pub fn job_start(&self, job: &Job) {
        if let Some(hook) = &self.on_job_start {
            guard("on_job_start", || hook(job));
        }
    }

    pub fn job_complete(&self, job: &Job) {
        if let Some(hook) = &self.on_job_complete {
            guard("on_job_complete", || hook(job));
        }
    }

    pub fn job_fail(&self, job: &Job, kind: ErrorCode) {
        if let Some(hook) = &self.on_job_fail {
            guard("on_job_fail", || hook(job, kind));
        }
    }

    pub fn deadline_at_risk(&self, study: &Study) {
        if let Some(hook) = &self.on_deadline_at_risk {
            guard("on_deadline_at_risk", || hook(study));
        }
    }

    pub fn checkpoint_created(&self, checkpoint: &Checkpoint) {
        if let Some(hook) = &self.on_checkpoint_created {
            guard("on_checkpoint_created", || hook(checkpoint));
        }
    }
}
