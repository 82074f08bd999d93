//! Study completion evaluation
//!
//! A study can complete when every required surface's completion rate meets
//! the coverage threshold. Optional surfaces contribute warnings only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::manifest::CompletionCriteria;

/// Terminal counts for one surface of a study.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurfaceCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Evaluation of one surface against the coverage threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceCompletion {
    pub surface_id: String,
    pub required: bool,
    pub total_cells: u64,
    pub completed_cells: u64,
    pub completion_rate: f64,
    pub threshold_met: bool,
}

/// Study-level completion verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyCompletionReport {
    pub can_complete: bool,
    pub surfaces: Vec<SurfaceCompletion>,
    pub warnings: Vec<String>,
}

/// Evaluate completion criteria against per-surface terminal counts.
pub fn evaluate_study(
    criteria: &CompletionCriteria,
    counts: &HashMap<String, SurfaceCounts>,
) -> StudyCompletionReport {
    let mut surfaces = Vec::new();
    let mut warnings = Vec::new();
    let mut can_complete = true;

    for surface_id in &criteria.required_surface_ids {
        let surface_counts = counts.get(surface_id).copied().unwrap_or_default();
        let rate = completion_rate(surface_counts);
        let threshold_met = rate >= criteria.coverage_threshold;
        if !threshold_met {
            can_complete = false;
        }
        surfaces.push(SurfaceCompletion {
            surface_id: surface_id.clone(),
            required: true,
            total_cells: surface_counts.total,
            completed_cells: surface_counts.completed,
            completion_rate: rate,
            threshold_met,
        });
    }

    for surface_id in &criteria.optional_surface_ids {
        let surface_counts = counts.get(surface_id).copied().unwrap_or_default();
        let rate = completion_rate(surface_counts);
        let threshold_met = rate >= criteria.coverage_threshold;
        if !threshold_met {
            warnings.push(format!(
                "optional surface '{surface_id}' below coverage threshold ({:.0}% < {:.0}%)",
                rate * 100.0,
                criteria.coverage_threshold * 100.0
            ));
        }
        surfaces.push(SurfaceCompletion {
            surface_id: surface_id.clone(),
            required: false,
            total_cells: surface_counts.total,
            completed_cells: surface_counts.completed,
            completion_rate: rate,
            threshold_met,
        });
    }

    if criteria.min_success_rate > 0.0 {
        let total: u64 = counts.values().map(|c| c.completed + c.failed).sum();
        let completed: u64 = counts.values().map(|c| c.completed).sum();
        if total > 0 {
            let success_rate = completed as f64 / total as f64;
            if success_rate < criteria.min_success_rate {
                warnings.push(format!(
                    "overall success rate {:.0}% is below the configured minimum {:.0}%",
                    success_rate * 100.0,
                    criteria.min_success_rate * 100.0
                ));
            }
        }
    }

    StudyCompletionReport {
        can_complete,
        surfaces,
        warnings,
    }
}

fn completion_rate(counts: SurfaceCounts) -> f64 {
    if counts.total == 0 {
        0.0
    } else {
        counts.completed as f64 / counts.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria(threshold: f64) -> CompletionCriteria {
        CompletionCriteria {
            required_surface_ids: vec!["openai-api".to_string()],
            coverage_threshold: threshold,
            optional_surface_ids: vec!["bing-search".to_string()],
            min_success_rate: 0.0,
            consecutive_failure_limit: 10,
            max_retries_per_cell: None,
        }
    }

    #[test]
    fn half_coverage_meets_a_half_threshold() {
        let counts = HashMap::from([
            (
                "openai-api".to_string(),
                SurfaceCounts {
                    total: 4,
                    completed: 2,
                    failed: 2,
                },
            ),
        ]);
        let report = evaluate_study(&criteria(0.5), &counts);
        assert!(report.can_complete);
        let surface = &report.surfaces[0];
        assert!(surface.threshold_met);
        assert!((surface.completion_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn required_surface_below_threshold_blocks_completion() {
        let counts = HashMap::from([
            (
                "openai-api".to_string(),
                SurfaceCounts {
                    total: 10,
                    completed: 4,
                    failed: 6,
                },
            ),
        ]);
        let report = evaluate_study(&criteria(0.8), &counts);
        assert!(!report.can_complete);
    }

    #[test]
    fn optional_surface_shortfall_only_warns() {
        let counts = HashMap::from([
            (
                "openai-api".to_string(),
                SurfaceCounts {
                    total: 2,
                    completed: 2,
                    failed: 0,
                },
            ),
            (
                "bing-search".to_string(),
                SurfaceCounts {
                    total: 2,
                    completed: 0,
                    failed: 2,
                },
            ),
        ]);
        let report = evaluate_study(&criteria(0.9), &counts);
        assert!(report.can_complete);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("bing-search"));
    }

    #[test]
    fn missing_required_surface_counts_as_zero_coverage() {
        let report = evaluate_study(&criteria(0.1), &HashMap::new());
        assert!(!report.can_complete);
    }
}
