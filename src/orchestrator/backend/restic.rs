//! restic adapter: structured, line-delimited JSON output.

use crate::orchestrator::backend::options::BackendOptions;
use crate::orchestrator::backend::types::{BackupResult, CheckResult, RestoreResult, Snapshot};
use crate::orchestrator::backend::{classify_lines, ensure_sources, Backend};
use crate::orchestrator::command::ToolCommand;
use crate::orchestrator::redacted::RedactedString;
use crate::orchestrator::result_error::error::Error;
use crate::orchestrator::result_error::result::Result;
use crate::orchestrator::result_error::{AddFunctionName, AddMsg};
use crate::orchestrator::retention::RetentionPolicy;
use crate::orchestrator::function_path;
use bon::Builder;
use chrono::{DateTime, Utc};
use function_name::named;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use validator::Validate;

fn default_binary() -> PathBuf {
    "restic".into()
}

fn default_password_env() -> String {
    "RESTIC_PASSWORD".into()
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct ResticBackend {
    #[serde(default = "default_binary")]
    #[builder(default = default_binary(), into)]
    binary: PathBuf,
    /// Name of the child environment variable carrying the repository password
    #[serde(default = "default_password_env")]
    #[builder(default = default_password_env(), into)]
    password_env: String,
    /// Inline password, otherwise the child inherits `password_env` from our environment
    #[validate(nested)]
    password: Option<RedactedString>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
}

impl Default for ResticBackend {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ResticBackend {
    fn command<I, S>(&self, repository: &str, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        ToolCommand::new(&self.binary)
            .args(args)
            .env("RESTIC_REPOSITORY", repository)
            .secret_env(&self.password_env, self.password.as_ref())
            .timeout(self.timeout)
    }

    fn try_backup(
        &self,
        sources: &[String],
        repository: &str,
        options: &BackendOptions,
        started: Instant,
    ) -> Result<BackupResult> {
        ensure_sources(sources)?;

        let mut args: Vec<String> = vec!["backup".into()];
        args.extend(sources.iter().cloned());
        for tag in options.get_list("tags") {
            args.extend(["--tag".into(), tag]);
        }
        for pattern in options.get_list("exclude") {
            args.extend(["--exclude".into(), pattern]);
        }
        if let Some(file) = options.get_str("exclude_file") {
            args.extend(["--exclude-file".into(), file.to_string()]);
        }
        args.push("--json".into());

        let output = self.command(repository, args).run()?;
        let duration = started.elapsed();

        let result = match find_summary(&output.stdout) {
            Some(summary) => BackupResult {
                bytes_added: u64_field(&summary, "data_added"),
                bytes_processed: u64_field(&summary, "total_bytes_processed"),
                files_new: u64_field(&summary, "files_new"),
                files_changed: u64_field(&summary, "files_changed"),
                files_unmodified: u64_field(&summary, "files_unmodified"),
                snapshot_id: summary
                    .get("snapshot_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                metadata: summary,
                ..BackupResult::succeeded(duration)
            },
            None => {
                tracing::warn!("restic backup printed no summary record, keeping raw output");
                let mut metadata = Map::new();
                metadata.insert("stdout".into(), output.stdout.into());
                BackupResult {
                    metadata,
                    ..BackupResult::succeeded(duration)
                }
            }
        };
        Ok(result)
    }

    fn try_restore(
        &self,
        repository: &str,
        snapshot_id: &str,
        target: &str,
        options: &BackendOptions,
        started: Instant,
    ) -> Result<RestoreResult> {
        std::fs::create_dir_all(target)
            .map_err(Error::from)
            .add_msg(format!("Cannot create restore target {target:?}"))?;

        let mut args: Vec<String> = vec![
            "restore".into(),
            snapshot_id.into(),
            "--target".into(),
            target.into(),
        ];
        for pattern in options.get_list("include") {
            args.extend(["--include".into(), pattern]);
        }
        args.push("--json".into());

        let output = self.command(repository, args).run()?;
        let mut result = RestoreResult::succeeded(started.elapsed());
        if let Some(summary) = find_summary(&output.stdout) {
            result.files_restored = u64_field(&summary, "files_restored");
            result.bytes_restored = u64_field(&summary, "bytes_restored");
        }
        Ok(result)
    }

    #[named]
    fn try_list_snapshots(&self, repository: &str, options: &BackendOptions) -> Result<Vec<Snapshot>> {
        let mut args: Vec<String> = vec!["snapshots".into()];
        for tag in options.get_list("tags") {
            args.extend(["--tag".into(), tag]);
        }
        for host in options.get_list("host") {
            args.extend(["--host".into(), host]);
        }
        args.push("--json".into());

        let output = self.command(repository, args).run()?;
        let records: Vec<Value> = serde_json::from_str(output.stdout.trim())
            .map_err(Error::from)
            .add_fn_name(function_path!())?;
        Ok(records.iter().filter_map(parse_snapshot).collect())
    }

    fn try_repository_size(&self, repository: &str) -> Result<u64> {
        let output = self.command(repository, ["stats", "--json"]).run()?;
        let stats: Map<String, Value> = serde_json::from_str(output.stdout.trim())?;
        Ok(u64_field(&stats, "total_size"))
    }

    /// Lets restic evaluate the policy itself with `forget --keep-*`.
    pub fn apply_retention_policy(
        &self,
        repository: &str,
        policy: &RetentionPolicy,
        prune: bool,
    ) -> Result<()> {
        let mut args: Vec<String> = vec!["forget".into()];
        for (flag, count) in policy.enabled_counts() {
            args.extend([format!("--{}", flag.replace('_', "-")), count.to_string()]);
        }
        if prune {
            args.push("--prune".into());
        }
        self.command(repository, args).run().map(|_| ())
    }
}

impl Backend for ResticBackend {
    fn backup(&self, sources: &[String], repository: &str, options: &BackendOptions) -> BackupResult {
        tracing::info!("restic backup of {:?} into {}", sources, repository);
        let started = Instant::now();
        self.try_backup(sources, repository, options, started)
            .unwrap_or_else(|e| BackupResult::failure(started.elapsed(), e))
    }

    fn check(&self, repository: &str, options: &BackendOptions) -> CheckResult {
        tracing::info!("restic check of {}", repository);
        let started = Instant::now();
        let mut args = vec!["check"];
        if options.flag("read_data") {
            args.push("--read-data");
        }

        match self.command(repository, args).run() {
            Ok(output) => {
                let (errors, warnings) = classify_lines(&output.stdout);
                CheckResult {
                    success: true,
                    errors,
                    warnings,
                    duration: started.elapsed(),
                    error_message: None,
                }
            }
            Err(e) => CheckResult::failure(started.elapsed(), e),
        }
    }

    fn restore(
        &self,
        repository: &str,
        snapshot_id: &str,
        target: &str,
        options: &BackendOptions,
    ) -> RestoreResult {
        tracing::info!("restic restore of {} into {}", snapshot_id, target);
        let started = Instant::now();
        self.try_restore(repository, snapshot_id, target, options, started)
            .unwrap_or_else(|e| RestoreResult::failure(started.elapsed(), e))
    }

    fn list_snapshots(&self, repository: &str, options: &BackendOptions) -> Vec<Snapshot> {
        self.try_list_snapshots(repository, options)
            .unwrap_or_else(|e| {
                tracing::error!("Failed to list restic snapshots of {}: {}", repository, e);
                Vec::new()
            })
    }

    fn forget(&self, repository: &str, snapshot_ids: &[String], options: &BackendOptions) -> Result<()> {
        if snapshot_ids.is_empty() {
            tracing::debug!("Nothing to forget in {}", repository);
            return Ok(());
        }
        tracing::info!("restic forget {:?} in {}", snapshot_ids, repository);
        let mut args: Vec<String> = vec!["forget".into()];
        args.extend(snapshot_ids.iter().cloned());
        if options.flag("prune") {
            args.push("--prune".into());
        }
        self.command(repository, args).run().map(|_| ())
    }

    fn prune(&self, repository: &str, _options: &BackendOptions) -> Result<()> {
        tracing::info!("restic prune of {}", repository);
        self.command(repository, ["prune"]).run().map(|_| ())
    }

    fn get_repository_size(&self, repository: &str) -> u64 {
        self.try_repository_size(repository).unwrap_or_else(|e| {
            tracing::warn!("Failed to get restic repository size, returning 0: {}", e);
            0
        })
    }
}

/// First well-formed `"message_type": "summary"` record, later ones are ignored.
fn find_summary(stdout: &str) -> Option<Map<String, Value>> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<Map<String, Value>>(line.trim()).ok())
        .find(|record| record.get("message_type").and_then(Value::as_str) == Some("summary"))
}

fn u64_field(record: &Map<String, Value>, key: &str) -> u64 {
    record.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn parse_snapshot(record: &Value) -> Option<Snapshot> {
    let id = record
        .get("short_id")
        .or_else(|| record.get("id"))
        .and_then(Value::as_str);
    let time = record
        .get("time")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok());

    let (Some(id), Some(time)) = (id, time) else {
        tracing::warn!("Skipping malformed restic snapshot record: {}", record);
        return None;
    };

    let strings = |key: &str| -> Vec<String> {
        record
            .get(key)
            .and_then(Value::as_array)
            .map(|v| v.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    };

    Some(
        Snapshot::builder()
            .id(id)
            .timestamp(time.with_timezone(&Utc))
            .hostname(record.get("hostname").and_then(Value::as_str).unwrap_or_default())
            .paths(strings("paths"))
            .tags(strings("tags"))
            .build(),
    )
}
