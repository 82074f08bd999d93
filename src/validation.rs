//! Validation - per-job quality gates and per-study completion checks

pub mod job_validator;
pub mod study_validator;

pub use job_validator::{
    Check, CheckSeverity, DEFAULT_ERROR_PATTERNS, JobValidationReport, JobValidationRequest,
    JobValidator, JobValidatorConfig, ValidationStatus, ValidatorStats,
};
pub use study_validator::{
    StudyCompletionReport, SurfaceCompletion, SurfaceCounts, evaluate_study,
};
