//! borg adapter: archives addressed as `repository::archive`, statistics scraped from text.

use crate::orchestrator::backend::options::BackendOptions;
use crate::orchestrator::backend::types::{BackupResult, CheckResult, RestoreResult, Snapshot};
use crate::orchestrator::backend::{classify_lines, ensure_sources, Backend};
use crate::orchestrator::command::ToolCommand;
use crate::orchestrator::function_path;
use crate::orchestrator::redacted::RedactedString;
use crate::orchestrator::result_error::error::Error;
use crate::orchestrator::result_error::result::Result;
use crate::orchestrator::result_error::{AddFunctionName, AddMsg};
use bon::Builder;
use chrono::{DateTime, NaiveDateTime, Utc};
use function_name::named;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use validator::Validate;

fn default_binary() -> PathBuf {
    "borg".into()
}

fn default_password_env() -> String {
    "BORG_PASSPHRASE".into()
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct BorgBackend {
    #[serde(default = "default_binary")]
    #[builder(default = default_binary(), into)]
    binary: PathBuf,
    #[serde(default = "default_password_env")]
    #[builder(default = default_password_env(), into)]
    password_env: String,
    #[validate(nested)]
    password: Option<RedactedString>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
}

impl Default for BorgBackend {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Numbers scraped from `borg create --stats`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct CreateStats {
    original_size: Option<u64>,
    compressed_size: Option<u64>,
    deduplicated_size: Option<u64>,
    number_files: Option<u64>,
}

impl CreateStats {
    fn parse(output: &str) -> Self {
        let mut stats = Self::default();
        for line in output.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("Original size:") {
                stats.original_size = stats.original_size.or(parse_human_size(rest));
            } else if let Some(rest) = line.strip_prefix("Compressed size:") {
                stats.compressed_size = stats.compressed_size.or(parse_human_size(rest));
            } else if let Some(rest) = line.strip_prefix("Deduplicated size:") {
                stats.deduplicated_size = stats.deduplicated_size.or(parse_human_size(rest));
            } else if let Some(rest) = line.strip_prefix("Number of files:") {
                stats.number_files = stats.number_files.or(rest.trim().parse().ok());
            } else if let Some(rest) = line.strip_prefix("This archive:") {
                // borg 1.x table row: original, compressed, deduplicated
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                if let [o, ou, c, cu, d, du] = tokens[..] {
                    stats.original_size = stats.original_size.or(size_with_unit(o, ou));
                    stats.compressed_size = stats.compressed_size.or(size_with_unit(c, cu));
                    stats.deduplicated_size = stats.deduplicated_size.or(size_with_unit(d, du));
                }
            }
        }
        stats
    }

    fn into_metadata(self) -> Map<String, Value> {
        [
            ("original_size", self.original_size),
            ("compressed_size", self.compressed_size),
            ("deduplicated_size", self.deduplicated_size),
            ("number_files", self.number_files),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), Value::from(v))))
        .collect()
    }
}

/// Parses `"1.50 GB"` style sizes, units are binary (1 KB = 1024 B).
fn parse_human_size(text: &str) -> Option<u64> {
    let mut tokens = text.split_whitespace();
    let value = tokens.next()?;
    let unit = tokens.next().unwrap_or("B");
    size_with_unit(value, unit)
}

fn size_with_unit(value: &str, unit: &str) -> Option<u64> {
    let multiplier: u64 = match unit {
        "B" => 1,
        "kB" | "KB" | "KiB" => 1 << 10,
        "MB" | "MiB" => 1 << 20,
        "GB" | "GiB" => 1 << 30,
        "TB" | "TiB" => 1 << 40,
        _ => return None,
    };
    let value: f64 = value.parse().ok().filter(|v: &f64| v.is_finite() && *v >= 0.0)?;
    Some((value * multiplier as f64).round() as u64)
}

fn parse_archive_time(time: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(time, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|t| t.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(time)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
}

impl BorgBackend {
    fn command<I, S>(&self, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        ToolCommand::new(&self.binary)
            .args(args)
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

        let archive_name = options
            .get_str("archive_name")
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string());

        let mut args: Vec<String> = vec![
            "create".into(),
            "--stats".into(),
            "--compression".into(),
            options.get_str("compression").unwrap_or("lz4").into(),
        ];
        for pattern in options.get_list("exclude") {
            args.extend(["--exclude".into(), pattern]);
        }
        args.push(format!("{repository}::{archive_name}"));
        args.extend(sources.iter().cloned());

        let output = self.command(args).run()?;
        let stats = CreateStats::parse(&output.combined());
        if stats.original_size.is_none() {
            tracing::warn!("No statistics found in borg create output for {}", archive_name);
        }

        Ok(BackupResult {
            bytes_added: stats.deduplicated_size.unwrap_or(0),
            bytes_processed: stats.original_size.unwrap_or(0),
            files_new: stats.number_files.unwrap_or(0),
            snapshot_id: Some(archive_name),
            metadata: stats.into_metadata(),
            ..BackupResult::succeeded(started.elapsed())
        })
    }

    fn try_restore(
        &self,
        repository: &str,
        snapshot_id: &str,
        target: &str,
        started: Instant,
    ) -> Result<RestoreResult> {
        std::fs::create_dir_all(target)
            .map_err(Error::from)
            .add_msg(format!("Cannot create restore target {target:?}"))?;

        // borg extracts into its working directory, only the child's is changed
        self.command(["extract".to_string(), format!("{repository}::{snapshot_id}")])
            .current_dir(target)
            .run()?;
        Ok(RestoreResult::succeeded(started.elapsed()))
    }

    #[named]
    fn try_list_snapshots(&self, repository: &str) -> Result<Vec<Snapshot>> {
        let output = self.command(["list", "--json", repository]).run()?;
        let listing: Map<String, Value> = serde_json::from_str(output.stdout.trim())
            .map_err(Error::from)
            .add_fn_name(function_path!())?;

        let archives = listing
            .get("archives")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(archives.iter().filter_map(parse_archive).collect())
    }

    fn try_repository_size(&self, repository: &str) -> Result<u64> {
        let output = self.command(["info", "--json", repository]).run()?;
        let info: Value = serde_json::from_str(output.stdout.trim())?;
        Ok(info
            .pointer("/cache/stats/unique_csize")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }
}

fn parse_archive(archive: &Value) -> Option<Snapshot> {
    let name = archive.get("name").and_then(Value::as_str);
    let time = archive
        .get("time")
        .and_then(Value::as_str)
        .and_then(parse_archive_time);

    let (Some(name), Some(time)) = (name, time) else {
        tracing::warn!("Skipping borg archive with missing name or unreadable time: {}", archive);
        return None;
    };
    Some(
        Snapshot::builder()
            .id(name)
            .timestamp(time)
            .hostname(archive.get("hostname").and_then(Value::as_str).unwrap_or_default())
            .build(),
    )
}

impl Backend for BorgBackend {
    fn backup(&self, sources: &[String], repository: &str, options: &BackendOptions) -> BackupResult {
        tracing::info!("borg create of {:?} into {}", sources, repository);
        let started = Instant::now();
        self.try_backup(sources, repository, options, started)
            .unwrap_or_else(|e| BackupResult::failure(started.elapsed(), e))
    }

    fn check(&self, repository: &str, _options: &BackendOptions) -> CheckResult {
        tracing::info!("borg check of {}", repository);
        let started = Instant::now();
        match self.command(["check", repository]).run() {
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
        _options: &BackendOptions,
    ) -> RestoreResult {
        tracing::info!("borg extract of {} into {}", snapshot_id, target);
        let started = Instant::now();
        self.try_restore(repository, snapshot_id, target, started)
            .unwrap_or_else(|e| RestoreResult::failure(started.elapsed(), e))
    }

    fn list_snapshots(&self, repository: &str, _options: &BackendOptions) -> Vec<Snapshot> {
        self.try_list_snapshots(repository).unwrap_or_else(|e| {
            tracing::error!("Failed to list borg archives of {}: {}", repository, e);
            Vec::new()
        })
    }

    fn forget(&self, repository: &str, snapshot_ids: &[String], _options: &BackendOptions) -> Result<()> {
        for archive in snapshot_ids {
            tracing::info!("borg delete {}::{}", repository, archive);
            self.command(["delete".to_string(), format!("{repository}::{archive}")])
                .run()?;
        }
        Ok(())
    }

    fn prune(&self, repository: &str, options: &BackendOptions) -> Result<()> {
        let keeps = options.keep_counts();
        if keeps.is_empty() {
            tracing::info!("No keep_* options for {}, skipping borg prune", repository);
            return Ok(());
        }

        let mut args: Vec<String> = vec!["prune".into(), repository.into()];
        for (key, count) in keeps {
            args.extend([format!("--{}", key.replace('_', "-")), count.to_string()]);
        }
        tracing::info!("borg prune of {}", repository);
        self.command(args).run().map(|_| ())
    }

    fn get_repository_size(&self, repository: &str) -> u64 {
        self.try_repository_size(repository).unwrap_or_else(|e| {
            tracing::warn!("Failed to get borg repository size, returning 0: {}", e);
            0
        })
    }
}
