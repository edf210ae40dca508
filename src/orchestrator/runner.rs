//! Entry points an external trigger calls to execute jobs.

use crate::orchestrator::backend::types::{BackupResult, CheckResult, Snapshot};
use crate::orchestrator::backend::Backend;
use crate::orchestrator::config::JobConfig;
use crate::orchestrator::function_path;
use crate::orchestrator::job::{JobRegistry, JobStatus};
use crate::orchestrator::result_error::result::Result;
use crate::orchestrator::result_error::AddFunctionName;
use crate::orchestrator::retention;
use function_name::named;
use itertools::Itertools;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one job during [`JobRunner::run_jobs`].
#[derive(Clone, Debug, Serialize)]
pub struct JobOutcome {
    pub job_name: String,
    pub backup: BackupResult,
    /// Snapshots removed by retention, empty when retention did not run
    pub deleted: Vec<Snapshot>,
    pub retention_error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct JobRunner {
    registry: Arc<JobRegistry>,
}

impl JobRunner {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Runs one backup and records the outcome in the registry.
    pub fn run_backup(&self, job: &JobConfig) -> BackupResult {
        let name = job.name();
        info!("Starting backup job {} ({})", name, job.backend().name());
        self.registry.set_status(name, JobStatus::Running);

        let backend = job.backend();
        let result = backend.backup(job.sources(), job.repository(), job.options());

        if result.success {
            let size = backend.get_repository_size(job.repository());
            self.registry
                .update_success(name, result.duration, result.bytes_added, size);
            if let Some(snapshot_id) = &result.snapshot_id {
                self.registry.set_metadata(name, "last_snapshot_id", snapshot_id);
            }
            info!(
                "Backup job {} finished in {:.1}s, {} bytes added",
                name,
                result.duration.as_secs_f64(),
                result.bytes_added
            );
        } else {
            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| "backup failed".to_string());
            error!("Backup job {} failed: {}", name, message);
            self.registry.update_failure(name, message);
        }

        result
    }

    /// Forgets every snapshot the job's policy does not keep, then prunes.
    ///
    /// Does nothing for an empty policy, since that policy keeps no snapshot at all.
    #[named]
    pub fn apply_retention(&self, job: &JobConfig) -> Result<Vec<Snapshot>> {
        let policy = job.retention();
        if policy.is_empty() {
            debug!("No retention policy for job {}, keeping everything", job.name());
            return Ok(Vec::new());
        }

        let backend = job.backend();
        let snapshots = backend.list_snapshots(job.repository(), job.options());
        let doomed = retention::to_delete(&snapshots, policy);
        if doomed.is_empty() {
            debug!("Retention for job {} has nothing to delete", job.name());
            return Ok(doomed);
        }

        let ids = doomed.iter().map(|s| s.id.clone()).collect_vec();
        info!(
            "Retention for job {} keeps {} of {} snapshots, forgetting {:?}",
            job.name(),
            snapshots.len() - doomed.len(),
            snapshots.len(),
            ids
        );
        backend
            .forget(job.repository(), &ids, job.options())
            .add_fn_name(function_path!())?;
        backend
            .prune(job.repository(), job.options())
            .add_fn_name(function_path!())?;
        Ok(doomed)
    }

    /// Checks the repository and records the verification result.
    ///
    /// The job shows [`JobStatus::Verifying`] while the check runs and gets its previous
    /// status back afterwards, a failed check never turns into a failed backup status.
    /// A backup that changed the status in the meantime keeps its own.
    pub fn run_verification(&self, job: &JobConfig) -> CheckResult {
        let name = job.name();
        info!("Verifying repository of job {}", name);
        let previous = self.registry.replace_status(name, JobStatus::Verifying);

        let result = job.backend().check(job.repository(), job.options());
        if !result.warnings.is_empty() {
            warn!("Verification of job {} reported warnings: {:?}", name, result.warnings);
        }
        if result.success {
            info!("Verification of job {} passed", name);
        } else {
            error!("Verification of job {} failed: {:?}", name, result.error_message);
        }
        self.registry
            .update_verification(name, result.success, result.error_message.clone());
        if !self
            .registry
            .restore_status_if(name, JobStatus::Verifying, previous)
        {
            debug!("Status of job {} changed during verification, not restoring {}", name, previous);
        }

        result
    }

    /// Backup followed by retention when the backup succeeded.
    pub fn run_job(&self, job: &JobConfig) -> JobOutcome {
        let backup = self.run_backup(job);
        let (deleted, retention_error) = if backup.success {
            match self.apply_retention(job) {
                Ok(deleted) => (deleted, None),
                Err(e) => {
                    error!("Retention for job {} failed: {}", job.name(), e);
                    (Vec::new(), Some(e.to_string()))
                }
            }
        } else {
            (Vec::new(), None)
        };

        JobOutcome {
            job_name: job.name().clone(),
            backup,
            deleted,
            retention_error,
        }
    }

    /// Runs every enabled job concurrently on `pool`, in no particular order.
    pub fn run_jobs(&self, jobs: &[JobConfig], pool: &ThreadPool) -> Vec<JobOutcome> {
        pool.install(|| {
            jobs.par_iter()
                .filter(|job| job.enabled())
                .map(|job| self.run_job(job))
                .collect()
        })
    }
}
