//! Study manifest - the immutable input describing a visibility study
//!
//! A manifest is a declarative cartesian product of queries, surfaces and
//! locations plus execution policy. It enters the engine only after boundary
//! validation produced a [`ValidatedManifest`].

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// A single query to pose on every surface in every location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySpec {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Target surface configuration. `required` surfaces count toward study
/// completion; the rest are best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceConfig {
    pub id: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

/// Proxy egress category requested for a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    Residential,
    Datacenter,
    Mobile,
}

/// Geographic vantage point configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    pub id: String,
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub require_sticky: bool,
    /// Provider id, or "auto" for highest-priority provider supporting the location.
    #[serde(default = "default_proxy_provider")]
    pub proxy_provider: String,
    /// Sticky session duration in minutes. 0 = rotating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_duration_minutes: Option<u32>,
}

fn default_proxy_provider() -> String {
    "auto".to_string()
}

/// When the study may be declared complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionCriteria {
    pub required_surface_ids: Vec<String>,
    /// Fraction of a required surface's cells that must complete, in [0, 1].
    pub coverage_threshold: f64,
    #[serde(default)]
    pub optional_surface_ids: Vec<String>,
    #[serde(default)]
    pub min_success_rate: f64,
    #[serde(default = "default_consecutive_failure_limit")]
    pub consecutive_failure_limit: u32,
    /// Deprecated: `execution.retry.max_retries` is authoritative. Parsed so
    /// older manifests keep loading; disagreement surfaces as a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries_per_cell: Option<u32>,
}

fn default_consecutive_failure_limit() -> u32 {
    10
}

/// Per-job output quality gates evaluated by the validator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityGates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_response_length: Option<usize>,
    #[serde(default)]
    pub require_actual_content: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_keywords: Vec<String>,
}

/// Checkpoint/auto-save policy for a study run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Save after this many cells reached a terminal state since the last save.
    #[serde(default = "default_save_interval_cells")]
    pub save_interval_cells: u32,
    /// Save after this many seconds elapsed since the last save.
    #[serde(default = "default_save_interval_seconds")]
    pub save_interval_seconds: u64,
    /// Keep the snapshot on finalize instead of deleting it.
    #[serde(default)]
    pub preserve_checkpoint: bool,
}

fn default_true() -> bool {
    true
}
fn default_save_interval_cells() -> u32 {
    10
}
fn default_save_interval_seconds() -> u64 {
    60
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            save_interval_cells: default_save_interval_cells(),
            save_interval_seconds: default_save_interval_seconds(),
            preserve_checkpoint: false,
        }
    }
}

/// Timeout scopes applied during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_timeout_ms: Option<u64>,
}

fn default_query_timeout_ms() -> u64 {
    120_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            surface_timeout_ms: None,
            study_timeout_ms: None,
        }
    }
}

/// Cell dispatch ordering when `shuffle_queries` is off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionOrder {
    /// Interleave queries across surfaces and locations.
    #[default]
    RoundRobin,
    SurfaceFirst,
    LocationFirst,
}

/// Execution policy: retry, checkpointing, concurrency and pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default = "default_concurrency_per_surface")]
    pub concurrency_per_surface: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    /// Random delay between consecutive queries on a worker, [min, max] ms.
    #[serde(default = "default_query_delay_ms")]
    pub query_delay_ms: (u64, u64),
    #[serde(default)]
    pub shuffle_queries: bool,
    /// Seed for the shuffle permutation. Absent = derived from the study id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle_seed: Option<u64>,
    #[serde(default)]
    pub execution_order: ExecutionOrder,
}

fn default_concurrency_per_surface() -> u32 {
    3
}
fn default_max_concurrency() -> u32 {
    10
}
fn default_query_delay_ms() -> (u64, u64) {
    (500, 2000)
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            checkpoint: CheckpointConfig::default(),
            timeouts: TimeoutConfig::default(),
            concurrency_per_surface: default_concurrency_per_surface(),
            max_concurrency: default_max_concurrency(),
            query_delay_ms: default_query_delay_ms(),
            shuffle_queries: false,
            shuffle_seed: None,
            execution_order: ExecutionOrder::default(),
        }
    }
}

/// How much evidence to capture per job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceLevel {
    Full,
    #[default]
    Metadata,
    None,
}

/// Whether adapter sessions are shared across studies or dedicated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionIsolation {
    #[default]
    Shared,
    DedicatedPerStudy,
}

/// The full declarative study definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyManifest {
    pub name: String,
    pub tenant_id: String,
    pub queries: Vec<QuerySpec>,
    pub surfaces: Vec<SurfaceConfig>,
    pub locations: Vec<LocationConfig>,
    pub completion_criteria: CompletionCriteria,
    #[serde(default)]
    pub quality_gates: QualityGates,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub evidence_level: EvidenceLevel,
    #[serde(default)]
    pub legal_hold: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_isolation: SessionIsolation,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Spend cap; breaching it pauses the study.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
}

fn default_retention_days() -> u32 {
    90
}

impl StudyManifest {
    /// Total number of cells this manifest expands to.
    pub fn total_cells(&self) -> usize {
        self.queries.len() * self.surfaces.len() * self.locations.len()
    }

    pub fn surface(&self, surface_id: &str) -> Option<&SurfaceConfig> {
        self.surfaces.iter().find(|s| s.id == surface_id)
    }

    pub fn is_required_surface(&self, surface_id: &str) -> bool {
        self.completion_criteria
            .required_surface_ids
            .iter()
            .any(|id| id == surface_id)
            || self.surface(surface_id).is_some_and(|s| s.required)
    }
}

/// A field-level validation failure with its JSON path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestIssue {
    pub field: String,
    pub message: String,
    pub constraint: String,
}

/// Non-blocking validation warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestWarning {
    pub field: String,
    pub message: String,
}

/// Outcome of boundary validation.
#[derive(Debug)]
pub enum ManifestValidation {
    Valid {
        manifest: Box<ValidatedManifest>,
        warnings: Vec<ManifestWarning>,
    },
    Invalid {
        errors: Vec<ManifestIssue>,
        warnings: Vec<ManifestWarning>,
    },
}

/// A manifest that passed boundary validation. The newtype keeps unvalidated
/// manifests out of the orchestrator at the type level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedManifest(StudyManifest);

impl ValidatedManifest {
    pub fn manifest(&self) -> &StudyManifest {
        &self.0
    }

    pub fn into_inner(self) -> StudyManifest {
        self.0
    }

    /// Validation bypass for unit tests that build manifests programmatically.
    #[cfg(any(test, feature = "testsuite"))]
    pub fn assume_valid(manifest: StudyManifest) -> Self {
        Self(manifest)
    }
}

impl std::ops::Deref for ValidatedManifest {
    type Target = StudyManifest;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Registries the boundary validator checks surface and location ids against.
#[derive(Debug, Default, Clone)]
pub struct ManifestRegistries {
    pub surface_ids: Vec<String>,
    pub location_ids: Vec<String>,
}

impl ManifestRegistries {
    fn knows_surface(&self, id: &str) -> bool {
        self.surface_ids.is_empty() || self.surface_ids.iter().any(|s| s == id)
    }

    fn knows_location(&self, id: &str) -> bool {
        self.location_ids.is_empty() || self.location_ids.iter().any(|l| l == id)
    }
}

/// Boundary validation: structural constraints, registry membership, ranges.
///
/// Returns every violation at once rather than failing fast, so callers can
/// present a complete report.
pub fn validate_manifest(
    manifest: StudyManifest,
    registries: &ManifestRegistries,
    now: DateTime<Utc>,
) -> ManifestValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if manifest.queries.is_empty() {
        errors.push(issue("queries", "at least one query is required", "min_items=1"));
    }
    if manifest.queries.len() > 1000 {
        errors.push(issue("queries", "too many queries", "max_items=1000"));
    }
    for (i, query) in manifest.queries.iter().enumerate() {
        if query.text.is_empty() || query.text.chars().count() > 10_000 {
            errors.push(issue(
                format!("queries[{i}].text"),
                "query text must be 1..10000 characters",
                "length=1..10000",
            ));
        }
    }

    if manifest.surfaces.is_empty() {
        errors.push(issue("surfaces", "at least one surface is required", "min_items=1"));
    }
    if manifest.surfaces.len() > 20 {
        errors.push(issue("surfaces", "too many surfaces", "max_items=20"));
    }
    for (i, surface) in manifest.surfaces.iter().enumerate() {
        if !registries.knows_surface(&surface.id) {
            errors.push(issue(
                format!("surfaces[{i}].id"),
                format!("unknown surface '{}'", surface.id),
                "registry_member",
            ));
        }
    }

    if manifest.locations.is_empty() {
        errors.push(issue("locations", "at least one location is required", "min_items=1"));
    }
    if manifest.locations.len() > 50 {
        errors.push(issue("locations", "too many locations", "max_items=50"));
    }
    for (i, location) in manifest.locations.iter().enumerate() {
        if !registries.knows_location(&location.id) {
            errors.push(issue(
                format!("locations[{i}].id"),
                format!("unknown location '{}'", location.id),
                "registry_member",
            ));
        }
        if location.session_duration_minutes.is_some() && !location.require_sticky {
            warnings.push(warning(
                format!("locations[{i}].session_duration_minutes"),
                "session duration is set but require_sticky is false",
            ));
        }
    }

    let threshold = manifest.completion_criteria.coverage_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        errors.push(issue(
            "completion_criteria.coverage_threshold",
            "coverage threshold must be within [0, 1]",
            "range=0..=1",
        ));
    } else if (threshold - 1.0).abs() < f64::EPSILON {
        warnings.push(warning(
            "completion_criteria.coverage_threshold",
            "threshold of 1.0 requires every cell to succeed; a single permanent failure blocks completion",
        ));
    }

    let retry = &manifest.execution.retry;
    if retry.max_retries > 10 {
        errors.push(issue("execution.retry.max_retries", "too many retries", "range=0..=10"));
    }
    if retry.max_retries == 1 {
        warnings.push(warning(
            "execution.retry.max_retries",
            "a single retry rarely survives transient outages",
        ));
    }
    if !(100..=60_000).contains(&retry.initial_delay_ms) {
        errors.push(issue(
            "execution.retry.initial_delay_ms",
            "initial delay out of range",
            "range=100..=60000",
        ));
    }
    if !(1000..=300_000).contains(&retry.max_delay_ms) {
        errors.push(issue(
            "execution.retry.max_delay_ms",
            "max delay out of range",
            "range=1000..=300000",
        ));
    }
    if !(1.0..=5.0).contains(&retry.backoff_multiplier) {
        errors.push(issue(
            "execution.retry.backoff_multiplier",
            "backoff multiplier out of range",
            "range=1..=5",
        ));
    }
    if let Some(per_cell) = manifest.completion_criteria.max_retries_per_cell {
        if per_cell != retry.max_retries {
            warnings.push(warning(
                "completion_criteria.max_retries_per_cell",
                "deprecated field disagrees with execution.retry.max_retries, which is authoritative",
            ));
        }
    }

    if !(1..=10).contains(&manifest.execution.concurrency_per_surface) {
        errors.push(issue(
            "execution.concurrency_per_surface",
            "per-surface concurrency out of range",
            "range=1..=10",
        ));
    }
    if !(1..=50).contains(&manifest.execution.max_concurrency) {
        errors.push(issue(
            "execution.max_concurrency",
            "max concurrency out of range",
            "range=1..=50",
        ));
    }

    if !(1..=2555).contains(&manifest.retention_days) {
        errors.push(issue(
            "retention_days",
            "retention out of range",
            "range=1..=2555",
        ));
    }
    if manifest.legal_hold && manifest.retention_days < 365 {
        warnings.push(warning(
            "retention_days",
            "legal hold with short retention is usually a mistake",
        ));
    }

    if let Some(deadline) = manifest.deadline {
        if deadline <= now {
            errors.push(issue("deadline", "deadline must be in the future", "future_instant"));
        } else if deadline - now < Duration::hours(1) {
            warnings.push(warning(
                "deadline",
                "deadline is less than one hour away",
            ));
        }
    }

    if manifest.total_cells() > 10_000 {
        warnings.push(warning(
            "queries",
            format!(
                "study expands to {} cells; expect a long run",
                manifest.total_cells()
            ),
        ));
    }

    if errors.is_empty() {
        ManifestValidation::Valid {
            manifest: Box::new(ValidatedManifest(manifest)),
            warnings,
        }
    } else {
        ManifestValidation::Invalid { errors, warnings }
    }
}

fn issue(field: impl Into<String>, message: impl Into<String>, constraint: impl Into<String>) -> ManifestIssue {
    ManifestIssue {
        field: field.into(),
        message: message.into(),
        constraint: constraint.into(),
    }
}

fn warning(field: impl Into<String>, message: impl Into<String>) -> ManifestWarning {
    ManifestWarning {
        field: field.into(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_manifest() -> StudyManifest {
        StudyManifest {
            name: "brand-visibility".to_string(),
            tenant_id: "tenant-1".to_string(),
            queries: vec![QuerySpec {
                text: "best running shoes".to_string(),
                category: None,
                tags: vec![],
            }],
            surfaces: vec![SurfaceConfig {
                id: "openai-api".to_string(),
                required: true,
                options: HashMap::new(),
            }],
            locations: vec![LocationConfig {
                id: "us-east".to_string(),
                proxy_type: ProxyType::Datacenter,
                require_sticky: false,
                proxy_provider: "auto".to_string(),
                session_duration_minutes: None,
            }],
            completion_criteria: CompletionCriteria {
                required_surface_ids: vec!["openai-api".to_string()],
                coverage_threshold: 0.8,
                optional_surface_ids: vec![],
                min_success_rate: 0.0,
                consecutive_failure_limit: 10,
                max_retries_per_cell: None,
            },
            quality_gates: QualityGates::default(),
            execution: ExecutionConfig::default(),
            evidence_level: EvidenceLevel::Metadata,
            legal_hold: false,
            deadline: None,
            session_isolation: SessionIsolation::Shared,
            retention_days: 90,
            max_cost_usd: None,
        }
    }

    #[test]
    fn minimal_manifest_validates() {
        let validation =
            validate_manifest(minimal_manifest(), &ManifestRegistries::default(), Utc::now());
        assert!(matches!(validation, ManifestValidation::Valid { .. }));
    }

    #[test]
    fn empty_queries_rejected_with_json_path() {
        let mut manifest = minimal_manifest();
        manifest.queries.clear();
        let ManifestValidation::Invalid { errors, .. } =
            validate_manifest(manifest, &ManifestRegistries::default(), Utc::now())
        else {
            panic!("expected invalid");
        };
        assert!(errors.iter().any(|e| e.field == "queries"));
    }

    #[test]
    fn oversized_query_text_reports_indexed_field() {
        let mut manifest = minimal_manifest();
        manifest.queries.push(QuerySpec {
            text: "x".repeat(10_001),
            category: None,
            tags: vec![],
        });
        let ManifestValidation::Invalid { errors, .. } =
            validate_manifest(manifest, &ManifestRegistries::default(), Utc::now())
        else {
            panic!("expected invalid");
        };
        assert!(errors.iter().any(|e| e.field == "queries[1].text"));
    }

    #[test]
    fn registry_membership_enforced_when_registry_present() {
        let registries = ManifestRegistries {
            surface_ids: vec!["google-serp".to_string()],
            location_ids: vec!["us-east".to_string()],
        };
        let ManifestValidation::Invalid { errors, .. } =
            validate_manifest(minimal_manifest(), &registries, Utc::now())
        else {
            panic!("expected invalid");
        };
        assert!(errors.iter().any(|e| e.field == "surfaces[0].id"));
    }

    #[test]
    fn near_deadline_and_full_threshold_warn_without_blocking() {
        let mut manifest = minimal_manifest();
        manifest.deadline = Some(Utc::now() + Duration::minutes(30));
        manifest.completion_criteria.coverage_threshold = 1.0;
        let ManifestValidation::Valid { warnings, .. } =
            validate_manifest(manifest, &ManifestRegistries::default(), Utc::now())
        else {
            panic!("expected valid");
        };
        assert!(warnings.iter().any(|w| w.field == "deadline"));
        assert!(warnings
            .iter()
            .any(|w| w.field == "completion_criteria.coverage_threshold"));
    }

    #[test]
    fn past_deadline_is_an_error() {
        let mut manifest = minimal_manifest();
        manifest.deadline = Some(Utc::now() - Duration::minutes(1));
        let validation = validate_manifest(manifest, &ManifestRegistries::default(), Utc::now());
        assert!(matches!(validation, ManifestValidation::Invalid { .. }));
    }
}
