//! Jobs - one cell of the study matrix in execution
//!
//! A cell is identified by `(query_index, surface_id, location_id)`; its
//! [`CellKey`] string form is stable across runs of the same manifest and is
//! the key used by checkpoints and retry bookkeeping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::ErrorCode;

/// Canonical identity of a cell: `"{queryIndex}-{surfaceId}-{locationId}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellKey(String);

impl CellKey {
    pub fn new(query_index: usize, surface_id: &str, location_id: &str) -> Self {
        Self(format!("{query_index}-{surface_id}-{location_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Query index component. Surface/location ids may themselves contain
    /// dashes, so only the leading index is recoverable unambiguously.
    pub fn query_index(&self) -> Option<usize> {
        self.0.split('-').next()?.parse().ok()
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CellKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Executing,
    Complete,
    Failed,
}

/// One cell in execution, with retry/state bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub study_id: String,
    pub query_index: usize,
    pub surface_id: String,
    pub location_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<CellKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl Job {
    pub fn new(study_id: &str, query_index: usize, surface_id: &str, location_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            study_id: study_id.to_string(),
            query_index,
            surface_id: surface_id.to_string(),
            location_id: location_id.to_string(),
            status: JobStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            last_attempt_at: None,
            depends_on: Vec::new(),
            result: None,
        }
    }

    pub fn cell_key(&self) -> CellKey {
        CellKey::new(self.query_index, &self.surface_id, &self.location_id)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Complete | JobStatus::Failed)
    }
}

/// Adapter response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    pub response_time_ms: u64,
}

/// Evidence captured alongside a response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_archive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub har_file: Option<String>,
}

impl Evidence {
    /// Evidence record for a response body: SHA-256 over the raw text.
    pub fn for_text(text: &str) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(text.as_bytes());
        Self {
            sha256: Some(format!("{digest:x}")),
            ..Self::default()
        }
    }
}

/// Validator verdict embedded in the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultValidation {
    pub passed_quality_gates: bool,
    pub is_actual_content: bool,
    pub response_length: usize,
}

/// Error recorded on a failed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

/// Execution context captured for audit: which session, proxy and account
/// produced this result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultContext {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Outcome of one adapter dispatch for a cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    #[serde(default)]
    pub validation: ResultValidation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    #[serde(default)]
    pub context: ResultContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl JobResult {
    pub fn ok(response: ResponseData) -> Self {
        let validation = ResultValidation {
            passed_quality_gates: true,
            is_actual_content: !response.text.trim().is_empty(),
            response_length: response.text.chars().count(),
        };
        Self {
            success: true,
            response: Some(response),
            evidence: None,
            validation,
            error: None,
            context: ResultContext::default(),
            cost_usd: None,
        }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            response: None,
            evidence: None,
            validation: ResultValidation::default(),
            error: Some(ResultError {
                code,
                message: message.into(),
                retryable: code.is_retryable_default(),
            }),
            context: ResultContext::default(),
            cost_usd: None,
        }
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }

    pub fn with_context(mut self, context: ResultContext) -> Self {
        self.context = context;
        self
    }
}

/// Per-cell retry bookkeeping persisted in checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryState {
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_time: Option<DateTime<Utc>>,
    pub exhausted: bool,
}
