//! Job graph - the expanded study matrix and its dispatch order
//!
//! One owner (the orchestrator) holds the graph; observers get copies. The
//! ready queue holds job ids in dispatch order; completed/failed sets plus
//! the jobs table make the conservation invariant checkable at any time.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::job::{CellKey, Job, JobStatus};
use crate::domain::manifest::{ExecutionOrder, StudyManifest};

#[derive(Debug)]
pub struct JobGraph {
    pub jobs: HashMap<String, Job>,
    pub by_cell: HashMap<CellKey, String>,
    /// Dispatch order (job ids). Jobs re-enter on retry.
    pub ready_queue: VecDeque<String>,
    /// Original full ordering, kept for checkpointing and restores.
    pub initial_order: Vec<CellKey>,
    pub completed: HashSet<String>,
    pub failed: HashSet<String>,
}

impl JobGraph {
    /// Expand a manifest into `Q x S x L` jobs in the configured order.
    pub fn build(study_id: &str, manifest: &StudyManifest) -> Self {
        let mut cells: Vec<(usize, usize, usize)> = Vec::with_capacity(manifest.total_cells());
        let queries = manifest.queries.len();
        let surfaces = manifest.surfaces.len();
        let locations = manifest.locations.len();

        match manifest.execution.execution_order {
            // Queries advance outermost: every surface and location sees
            // query N before any sees query N+1.
            ExecutionOrder::RoundRobin => {
                for q in 0..queries {
                    for s in 0..surfaces {
                        for l in 0..locations {
                            cells.push((q, s, l));
                        }
                    }
                }
            }
            ExecutionOrder::SurfaceFirst => {
                for s in 0..surfaces {
                    for l in 0..locations {
                        for q in 0..queries {
                            cells.push((q, s, l));
                        }
                    }
                }
            }
            ExecutionOrder::LocationFirst => {
                for l in 0..locations {
                    for s in 0..surfaces {
                        for q in 0..queries {
                            cells.push((q, s, l));
                        }
                    }
                }
            }
        }

        if manifest.execution.shuffle_queries {
            let seed = manifest
                .execution
                .shuffle_seed
                .unwrap_or_else(|| seed_from_study_id(study_id));
            let mut rng = fastrand::Rng::with_seed(seed);
            rng.shuffle(&mut cells);
        }

        let mut jobs = HashMap::with_capacity(cells.len());
        let mut by_cell = HashMap::with_capacity(cells.len());
        let mut ready_queue = VecDeque::with_capacity(cells.len());
        let mut initial_order = Vec::with_capacity(cells.len());

        for (q, s, l) in cells {
            let job = Job::new(
                study_id,
                q,
                &manifest.surfaces[s].id,
                &manifest.locations[l].id,
            );
            let cell_key = job.cell_key();
            by_cell.insert(cell_key.clone(), job.id.clone());
            ready_queue.push_back(job.id.clone());
            initial_order.push(cell_key);
            jobs.insert(job.id.clone(), job);
        }

        Self {
            jobs,
            by_cell,
            ready_queue,
            initial_order,
            completed: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(job_id)
    }

    pub fn job_by_cell(&self, cell_key: &CellKey) -> Option<&Job> {
        self.by_cell.get(cell_key).and_then(|id| self.jobs.get(id))
    }

    pub fn executing_count(&self) -> u64 {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Executing)
            .count() as u64
    }

    pub fn executing_count_for_surface(&self, surface_id: &str) -> u64 {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Executing && j.surface_id == surface_id)
            .count() as u64
    }

    /// Terminal counts per surface, for the completion evaluation.
    pub fn surface_counts(
        &self,
    ) -> HashMap<String, crate::validation::study_validator::SurfaceCounts> {
        let mut counts: HashMap<String, crate::validation::study_validator::SurfaceCounts> =
            HashMap::new();
        for job in self.jobs.values() {
            let entry = counts.entry(job.surface_id.clone()).or_default();
            entry.total += 1;
            match job.status {
                JobStatus::Complete => entry.completed += 1,
                JobStatus::Failed => entry.failed += 1,
                _ => {}
            }
        }
        counts
    }

    /// Every job terminal?
    pub fn is_settled(&self) -> bool {
        self.completed.len() + self.failed.len() == self.jobs.len()
    }
}

fn seed_from_study_id(study_id: &str) -> u64 {
    // Stable non-cryptographic fold; the exact constant only needs to spread
    // uuid bytes.
    study_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
            (acc ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01B3)
        })
}
