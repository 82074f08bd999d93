//! Per-job quality gates
//!
//! Each job result runs through an ordered list of checks; severities decide
//! the final verdict. `strict_mode` elevates warnings to failures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::job::JobResult;
use crate::domain::manifest::{EvidenceLevel, QualityGates};

/// Responses matching any of these (case-insensitive substring) are treated
/// as error pages rather than real content.
pub const DEFAULT_ERROR_PATTERNS: &[&str] = &[
    "error",
    "404",
    "not found",
    "access denied",
    "forbidden",
    "rate limit",
    "too many requests",
    "temporarily unavailable",
    "service unavailable",
    "internal server error",
    "bad gateway",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
    Error,
    Warning,
    Info,
}

/// One evaluated quality check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub severity: CheckSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Check {
    fn new(
        name: &str,
        passed: bool,
        message: impl Into<String>,
        severity: CheckSeverity,
    ) -> Self {
        Self {
            name: name.to_string(),
            passed,
            message: message.into(),
            severity,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    Warning,
    Failed,
}

/// Outcome of validating one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobValidationReport {
    pub job_id: String,
    pub surface_id: String,
    pub status: ValidationStatus,
    pub checks: Vec<Check>,
}

impl JobValidationReport {
    pub fn passed(&self) -> bool {
        self.status != ValidationStatus::Failed
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Validation request for one job.
#[derive(Debug)]
pub struct JobValidationRequest<'a> {
    pub job_id: &'a str,
    pub surface_id: &'a str,
    pub result: Option<&'a JobResult>,
    pub quality_gates: &'a QualityGates,
    pub evidence_level: EvidenceLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobValidatorConfig {
    /// Elevate warnings to failures.
    #[serde(default)]
    pub strict_mode: bool,
    /// Override the default error patterns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_patterns: Option<Vec<String>>,
}

impl Default for JobValidatorConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            error_patterns: None,
        }
    }
}

/// Running totals across validations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorStats {
    pub total: u64,
    pub passed: u64,
    pub warnings: u64,
    pub failed: u64,
    pub pass_rate: f64,
    /// Failed check name -> occurrences.
    pub failure_reasons: HashMap<String, u64>,
}

/// Stateless check evaluation plus accumulated stats.
#[derive(Debug, Default)]
pub struct JobValidator {
    config: JobValidatorConfig,
    stats: std::sync::Mutex<ValidatorStats>,
}

impl JobValidator {
    pub fn new(config: JobValidatorConfig) -> Self {
        Self {
            config,
            stats: std::sync::Mutex::new(ValidatorStats::default()),
        }
    }

    pub fn validate(&self, request: &JobValidationRequest<'_>) -> JobValidationReport {
        let mut checks = Vec::new();

        let Some(result) = request.result else {
            checks.push(Check::new(
                "result_present",
                false,
                "job produced no result",
                CheckSeverity::Error,
            ));
            return self.finish(request, checks);
        };
        checks.push(Check::new(
            "result_present",
            true,
            "result present",
            CheckSeverity::Error,
        ));

        checks.push(Check::new(
            "job_success",
            result.success,
            if result.success {
                "job reported success".to_string()
            } else {
                format!(
                    "job reported failure: {}",
                    result
                        .error
                        .as_ref()
                        .map_or("unknown error", |e| e.message.as_str())
                )
            },
            CheckSeverity::Error,
        ));

        let text = result.response.as_ref().map_or("", |r| r.text.as_str());
        let content_severity = if request.quality_gates.require_actual_content {
            CheckSeverity::Error
        } else {
            CheckSeverity::Warning
        };
        checks.push(Check::new(
            "content_present",
            !text.trim().is_empty(),
            if text.trim().is_empty() {
                "response has no content"
            } else {
                "response has content"
            },
            content_severity,
        ));

        if let Some(min_length) = request.quality_gates.min_response_length {
            let length = text.chars().count();
            checks.push(Check::new(
                "min_length",
                length >= min_length,
                format!("response length {length} (minimum {min_length})"),
                CheckSeverity::Warning,
            ));
        }

        let patterns = self.config.error_patterns.as_deref();
        let lowered = text.to_lowercase();
        let matched: Vec<String> = match patterns {
            Some(patterns) => patterns
                .iter()
                .filter(|p| lowered.contains(&p.to_lowercase()))
                .cloned()
                .collect(),
            None => DEFAULT_ERROR_PATTERNS
                .iter()
                .filter(|p| lowered.contains(*p))
                .map(|p| p.to_string())
                .collect(),
        };
        let mut error_pattern_check = Check::new(
            "error_pattern",
            matched.is_empty(),
            if matched.is_empty() {
                "no error pattern matched".to_string()
            } else {
                format!("response matches error patterns: {}", matched.join(", "))
            },
            CheckSeverity::Error,
        );
        if !matched.is_empty() {
            error_pattern_check.details = Some(serde_json::json!({ "patterns": matched }));
        }
        checks.push(error_pattern_check);

        if !request.quality_gates.required_keywords.is_empty() {
            let missing: Vec<&String> = request
                .quality_gates
                .required_keywords
                .iter()
                .filter(|k| !lowered.contains(&k.to_lowercase()))
                .collect();
            checks.push(Check::new(
                "required_keywords",
                missing.is_empty(),
                if missing.is_empty() {
                    "all required keywords present".to_string()
                } else {
                    format!(
                        "missing required keywords: {}",
                        missing
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                },
                CheckSeverity::Warning,
            ));
        }

        if !request.quality_gates.forbidden_keywords.is_empty() {
            let found: Vec<&String> = request
                .quality_gates
                .forbidden_keywords
                .iter()
                .filter(|k| lowered.contains(&k.to_lowercase()))
                .collect();
            checks.push(Check::new(
                "forbidden_keywords",
                found.is_empty(),
                if found.is_empty() {
                    "no forbidden keywords present".to_string()
                } else {
                    format!(
                        "forbidden keywords present: {}",
                        found
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                },
                CheckSeverity::Warning,
            ));
        }

        if request.evidence_level == EvidenceLevel::Full {
            let evidence = result.evidence.as_ref();
            checks.push(Check::new(
                "evidence_present",
                evidence.is_some(),
                if evidence.is_some() {
                    "evidence captured"
                } else {
                    "evidence missing at full evidence level"
                },
                CheckSeverity::Error,
            ));
            checks.push(Check::new(
                "evidence_hash",
                evidence.is_some_and(|e| e.sha256.as_ref().is_some_and(|h| h.len() == 64)),
                "evidence sha256 present and well-formed",
                CheckSeverity::Error,
            ));
            checks.push(Check::new(
                "evidence_timestamp",
                evidence.is_some_and(|e| e.timestamp_token.is_some()),
                "evidence timestamp token present",
                CheckSeverity::Warning,
            ));
            checks.push(Check::new(
                "evidence_screenshot",
                evidence.is_some_and(|e| e.screenshot.is_some()),
                "evidence screenshot present",
                CheckSeverity::Warning,
            ));
        }

        self.finish(request, checks)
    }

    fn finish(&self, request: &JobValidationRequest<'_>, checks: Vec<Check>) -> JobValidationReport {
        let error_failed = checks
            .iter()
            .any(|c| !c.passed && c.severity == CheckSeverity::Error);
        let warning_failed = checks
            .iter()
            .any(|c| !c.passed && c.severity == CheckSeverity::Warning);

        let status = if error_failed || (warning_failed && self.config.strict_mode) {
            ValidationStatus::Failed
        } else if warning_failed {
            ValidationStatus::Warning
        } else {
            ValidationStatus::Passed
        };

        let report = JobValidationReport {
            job_id: request.job_id.to_string(),
            surface_id: request.surface_id.to_string(),
            status,
            checks,
        };

        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.total += 1;
        match status {
            ValidationStatus::Passed => stats.passed += 1,
            ValidationStatus::Warning => stats.warnings += 1,
            ValidationStatus::Failed => stats.failed += 1,
        }
        stats.pass_rate = if stats.total == 0 {
            1.0
        } else {
            (stats.total - stats.failed) as f64 / stats.total as f64
        };
        for check in report.failed_checks() {
            *stats.failure_reasons.entry(check.name.clone()).or_insert(0) += 1;
        }
        report
    }

    pub fn stats(&self) -> ValidatorStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::{Evidence, ResponseData};

    fn ok_result(text: &str) -> JobResult {
        JobResult::ok(ResponseData {
            text: text.to_string(),
            structured: None,
            response_time_ms: 100,
        })
    }

    fn gates() -> QualityGates {
        QualityGates {
            min_response_length: Some(10),
            require_actual_content: true,
            required_keywords: vec![],
            forbidden_keywords: vec![],
        }
    }

    fn validate(
        validator: &JobValidator,
        result: Option<&JobResult>,
        gates: &QualityGates,
        level: EvidenceLevel,
    ) -> JobValidationReport {
        validator.validate(&JobValidationRequest {
            job_id: "job-1",
            surface_id: "openai-api",
            result,
            quality_gates: gates,
            evidence_level: level,
        })
    }

    #[test]
    fn healthy_result_passes() {
        let validator = JobValidator::default();
        let result = ok_result("a long and meaningful answer about running shoes");
        let report = validate(&validator, Some(&result), &gates(), EvidenceLevel::Metadata);
        assert_eq!(report.status, ValidationStatus::Passed);
        assert!(report.checks.iter().all(|c| c.passed));
    }

    #[test]
    fn missing_result_fails_immediately() {
        let validator = JobValidator::default();
        let report = validate(&validator, None, &gates(), EvidenceLevel::Metadata);
        assert_eq!(report.status, ValidationStatus::Failed);
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].name, "result_present");
    }

    #[test]
    fn error_patterns_match_case_insensitively() {
        let validator = JobValidator::default();
        let result = ok_result("503 Service Unavailable - please retry later on");
        let report = validate(&validator, Some(&result), &gates(), EvidenceLevel::Metadata);
        assert_eq!(report.status, ValidationStatus::Failed);
        let check = report
            .checks
            .iter()
            .find(|c| c.name == "error_pattern")
            .unwrap();
        assert!(!check.passed);
    }

    #[test]
    fn short_response_warns_then_fails_under_strict() {
        let lenient = JobValidator::default();
        let result = ok_result("short");
        let report = validate(&lenient, Some(&result), &gates(), EvidenceLevel::Metadata);
        assert_eq!(report.status, ValidationStatus::Warning);

        let strict = JobValidator::new(JobValidatorConfig {
            strict_mode: true,
            error_patterns: None,
        });
        let report = validate(&strict, Some(&result), &gates(), EvidenceLevel::Metadata);
        assert_eq!(report.status, ValidationStatus::Failed);
    }

    #[test]
    fn keyword_gates_report_specifics() {
        let validator = JobValidator::default();
        let mut quality_gates = gates();
        quality_gates.required_keywords = vec!["nike".to_string(), "adidas".to_string()];
        quality_gates.forbidden_keywords = vec!["lorem ipsum".to_string()];
        let result = ok_result("The best shoes include Nike Pegasus and others.");
        let report = validate(&validator, Some(&result), &quality_gates, EvidenceLevel::Metadata);
        assert_eq!(report.status, ValidationStatus::Warning);
        let required = report
            .checks
            .iter()
            .find(|c| c.name == "required_keywords")
            .unwrap();
        assert!(!required.passed);
        assert!(required.message.contains("adidas"));
    }

    #[test]
    fn full_evidence_level_requires_hash() {
        let validator = JobValidator::default();
        let bare = ok_result("a long and meaningful answer to the question");
        let report = validate(&validator, Some(&bare), &gates(), EvidenceLevel::Full);
        assert_eq!(report.status, ValidationStatus::Failed);

        let text = "a long and meaningful answer to the question";
        let with_evidence = ok_result(text).with_evidence(Evidence {
            timestamp_token: Some("tsr".to_string()),
            screenshot: Some("shot.png".to_string()),
            ..Evidence::for_text(text)
        });
        let report = validate(&validator, Some(&with_evidence), &gates(), EvidenceLevel::Full);
        assert_eq!(report.status, ValidationStatus::Passed);
    }

    #[test]
    fn stats_accumulate_with_histogram() {
        let validator = JobValidator::default();
        let good = ok_result("a perfectly good response with enough length");
        let _ = validate(&validator, Some(&good), &gates(), EvidenceLevel::Metadata);
        let _ = validate(&validator, None, &gates(), EvidenceLevel::Metadata);
        let _ = validate(&validator, None, &gates(), EvidenceLevel::Metadata);

        let stats = validator.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.failure_reasons.get("result_present"), Some(&2));
        assert!((stats.pass_rate - 1.0 / 3.0).abs() < 1e-9);
    }
}
