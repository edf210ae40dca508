//! zfs adapter: snapshots plus `zfs send` streams.
//!
//! The repository is either an absolute file path (stream dumped to a file) or a
//! dataset that receives the stream through `zfs receive -F`.

use crate::orchestrator::backend::options::BackendOptions;
use crate::orchestrator::backend::types::{BackupResult, CheckResult, RestoreResult, Snapshot};
use crate::orchestrator::backend::{ensure_sources, Backend};
use crate::orchestrator::command::ToolCommand;
use crate::orchestrator::pipeline::{PipelineSink, SendReceivePipeline};
use crate::orchestrator::result_error::result::Result;
use crate::orchestrator::result_error::AddMsg;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use validator::Validate;

static ERROR_STATES: [&str; 3] = ["DEGRADED", "FAULTED", "UNAVAIL"];
static NO_KNOWN_ERRORS: &str = "No known data errors";

fn default_zfs_binary() -> PathBuf {
    "zfs".into()
}

fn default_zpool_binary() -> PathBuf {
    "zpool".into()
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct ZfsBackend {
    #[serde(default = "default_zfs_binary")]
    #[builder(default = default_zfs_binary(), into)]
    zfs_binary: PathBuf,
    #[serde(default = "default_zpool_binary")]
    #[builder(default = default_zpool_binary(), into)]
    zpool_binary: PathBuf,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
}

impl Default for ZfsBackend {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ZfsBackend {
    fn zfs<I, S>(&self, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        ToolCommand::new(&self.zfs_binary).args(args).timeout(self.timeout)
    }

    fn receive_into(&self, dataset: &str) -> ToolCommand {
        self.zfs(["receive", "-F", dataset])
    }

    fn try_backup(
        &self,
        sources: &[String],
        repository: &str,
        options: &BackendOptions,
        started: Instant,
    ) -> Result<BackupResult> {
        ensure_sources(sources)?;
        if sources.len() > 1 {
            tracing::warn!("zfs backs up one dataset per job, ignoring {:?}", &sources[1..]);
        }
        let dataset = &sources[0];
        let snapshot_name = options
            .get_str("snapshot_name")
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().format("backup-%Y%m%d-%H%M%S").to_string());
        let snapshot = format!("{dataset}@{snapshot_name}");

        self.zfs(["snapshot", snapshot.as_str()])
            .run()
            .add_msg(format!("Failed to create snapshot {snapshot}"))?;

        let mut send_args: Vec<String> = vec!["send".into()];
        if let Some(base) = options.get_str("incremental_base") {
            send_args.extend(["-i".into(), format!("{dataset}@{base}")]);
        }
        send_args.push(snapshot.clone());

        let sink = if repository.starts_with('/') {
            PipelineSink::File(repository.into())
        } else {
            PipelineSink::Command(self.receive_into(repository))
        };
        SendReceivePipeline::new(self.zfs(send_args), sink).run()?;

        let bytes = self.used_bytes(&snapshot);
        let mut metadata = Map::new();
        metadata.insert("dataset".into(), Value::from(dataset.as_str()));
        metadata.insert("snapshot".into(), Value::from(snapshot));

        Ok(BackupResult {
            bytes_added: bytes,
            bytes_processed: bytes,
            snapshot_id: Some(snapshot_name),
            metadata,
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
        let snapshot = format!("{repository}@{snapshot_id}");
        SendReceivePipeline::new(
            self.zfs(["send", snapshot.as_str()]),
            PipelineSink::Command(self.receive_into(target)),
        )
        .run()?;

        Ok(RestoreResult {
            bytes_restored: self.used_bytes(&snapshot),
            ..RestoreResult::succeeded(started.elapsed())
        })
    }

    fn try_used_bytes(&self, name: &str) -> Result<u64> {
        let output = self.zfs(["get", "-Hp", "-o", "value", "used", name]).run()?;
        Ok(output.stdout.trim().parse::<u64>()?)
    }

    fn used_bytes(&self, name: &str) -> u64 {
        self.try_used_bytes(name).unwrap_or_else(|e| {
            tracing::warn!("Failed to read used bytes of {}, returning 0: {}", name, e);
            0
        })
    }
}

fn parse_snapshot_line(line: &str) -> Option<Snapshot> {
    let mut fields = line.split('\t');
    let (name, creation) = (fields.next()?, fields.next()?);
    let (dataset, snapshot) = name.split_once('@')?;
    let timestamp = DateTime::from_timestamp(creation.trim().parse().ok()?, 0)?;
    Some(
        Snapshot::builder()
            .id(snapshot)
            .timestamp(timestamp)
            .paths(vec![dataset.to_string()])
            .build(),
    )
}

impl Backend for ZfsBackend {
    fn backup(&self, sources: &[String], repository: &str, options: &BackendOptions) -> BackupResult {
        tracing::info!("zfs backup of {:?} into {}", sources, repository);
        let started = Instant::now();
        self.try_backup(sources, repository, options, started)
            .unwrap_or_else(|e| BackupResult::failure(started.elapsed(), e))
    }

    fn check(&self, repository: &str, _options: &BackendOptions) -> CheckResult {
        let pool = repository.split('/').next().unwrap_or(repository);
        tracing::info!("zpool status of {}", pool);
        let started = Instant::now();

        let output = match ToolCommand::new(&self.zpool_binary)
            .args(["status", pool])
            .timeout(self.timeout)
            .run()
        {
            Ok(output) => output,
            Err(e) => return CheckResult::failure(started.elapsed(), e),
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for line in output.stdout.lines().map(str::trim) {
            if ERROR_STATES.iter().any(|state| line.contains(state)) {
                errors.push(line.to_string());
            } else if line.contains("errors:") && !line.contains(NO_KNOWN_ERRORS) {
                warnings.push(line.to_string());
            }
        }

        let error_message = (!errors.is_empty()).then(|| {
            tracing::error!("Pool {} is unhealthy: {:?}", pool, errors);
            format!("pool {} reported {} unhealthy device line(s)", pool, errors.len())
        });
        CheckResult {
            success: errors.is_empty(),
            errors,
            warnings,
            duration: started.elapsed(),
            error_message,
        }
    }

    fn restore(
        &self,
        repository: &str,
        snapshot_id: &str,
        target: &str,
        _options: &BackendOptions,
    ) -> RestoreResult {
        tracing::info!("zfs restore of {}@{} into {}", repository, snapshot_id, target);
        let started = Instant::now();
        self.try_restore(repository, snapshot_id, target, started)
            .unwrap_or_else(|e| RestoreResult::failure(started.elapsed(), e))
    }

    fn list_snapshots(&self, repository: &str, _options: &BackendOptions) -> Vec<Snapshot> {
        let output = match self
            .zfs(["list", "-t", "snapshot", "-H", "-p", "-o", "name,creation", repository])
            .run()
        {
            Ok(output) => output,
            Err(e) => {
                tracing::error!("Failed to list zfs snapshots of {}: {}", repository, e);
                return Vec::new();
            }
        };

        output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let snapshot = parse_snapshot_line(line);
                if snapshot.is_none() {
                    tracing::warn!("Skipping unreadable zfs list line: {:?}", line);
                }
                snapshot
            })
            .collect()
    }

    fn forget(&self, repository: &str, snapshot_ids: &[String], _options: &BackendOptions) -> Result<()> {
        for id in snapshot_ids {
            let snapshot = format!("{repository}@{id}");
            tracing::info!("zfs destroy {}", snapshot);
            self.zfs(["destroy", snapshot.as_str()]).run()?;
        }
        Ok(())
    }

    fn prune(&self, repository: &str, _options: &BackendOptions) -> Result<()> {
        tracing::debug!("zfs frees space on destroy, nothing to prune in {}", repository);
        Ok(())
    }

    fn get_repository_size(&self, repository: &str) -> u64 {
        self.used_bytes(repository)
    }
}
