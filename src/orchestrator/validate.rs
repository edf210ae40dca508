//! Validation functions for configuration values.
//!
//! Schedules are only checked for syntax here, evaluating them is left to
//! whatever triggers the jobs.

use crate::orchestrator::config::{JobConfig, OrchestratorConfig};
use chrono::Utc;
use itertools::Itertools;
use validator::ValidationError;

pub fn validate_cron_str<S: AsRef<str>>(cron: S) -> Result<(), ValidationError> {
    let cron = cron.as_ref();
    if cron_parser::parse(cron, &Utc::now()).is_err() {
        return Err(ValidationError::new("InvalidCron")
            .with_message(format!("Invalid cron string: {cron:?}").into()));
    }

    Ok(())
}

pub fn validate_job_schedules(job: &JobConfig) -> Result<(), ValidationError> {
    match job.verification_schedule() {
        Some(cron) => validate_cron_str(cron).map_err(|e| {
            ValidationError::new("InvalidVerificationSchedule").with_message(
                format!("job {:?}: {}", job.name(), e.message.unwrap_or_default()).into(),
            )
        }),
        None => Ok(()),
    }
}

pub fn validate_unique_job_names(config: &OrchestratorConfig) -> Result<(), ValidationError> {
    let duplicates = config
        .jobs()
        .iter()
        .map(|job| job.name().as_str())
        .duplicates()
        .collect_vec();

    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new("DuplicateJobName")
            .with_message(format!("Job names must be unique, repeated: {duplicates:?}").into()))
    }
}
