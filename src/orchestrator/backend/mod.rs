pub mod borg;
pub mod options;
pub mod restic;
pub mod types;
pub mod zfs;

use crate::orchestrator::backend::borg::BorgBackend;
use crate::orchestrator::backend::options::BackendOptions;
use crate::orchestrator::backend::restic::ResticBackend;
use crate::orchestrator::backend::types::{BackupResult, CheckResult, RestoreResult, Snapshot};
use crate::orchestrator::backend::zfs::ZfsBackend;
use crate::orchestrator::result_error::error::Error;
use crate::orchestrator::result_error::result::Result;
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::result;
use validator::{Validate, ValidationErrors};

/// Capability contract shared by every backup tool adapter.
///
/// `backup`, `check` and `restore` never fail the caller: any tool error ends up in
/// the returned record with `success == false`. `list_snapshots` and
/// `get_repository_size` degrade to an empty list / zero. `forget` and `prune`
/// propagate failures since there is no meaningful degraded answer.
pub trait Backend: Send + Sync {
    fn backup(&self, sources: &[String], repository: &str, options: &BackendOptions) -> BackupResult;

    fn check(&self, repository: &str, options: &BackendOptions) -> CheckResult;

    fn restore(
        &self,
        repository: &str,
        snapshot_id: &str,
        target: &str,
        options: &BackendOptions,
    ) -> RestoreResult;

    fn list_snapshots(&self, repository: &str, options: &BackendOptions) -> Vec<Snapshot>;

    fn forget(&self, repository: &str, snapshot_ids: &[String], options: &BackendOptions) -> Result<()>;

    fn prune(&self, repository: &str, options: &BackendOptions) -> Result<()>;

    fn get_repository_size(&self, repository: &str) -> u64;
}

/// Backend selector as written in the job configuration.
#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "backend_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum BackendConfig {
    Restic(ResticBackend),
    Borg(BorgBackend),
    Zfs(ZfsBackend),
}

impl BackendConfig {
    fn inner(&self) -> &dyn Backend {
        match self {
            BackendConfig::Restic(b) => b,
            BackendConfig::Borg(b) => b,
            BackendConfig::Zfs(b) => b,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Restic(_) => "restic",
            BackendConfig::Borg(_) => "borg",
            BackendConfig::Zfs(_) => "zfs",
        }
    }
}

impl Validate for BackendConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            BackendConfig::Restic(inner) => inner.validate(),
            BackendConfig::Borg(inner) => inner.validate(),
            BackendConfig::Zfs(inner) => inner.validate(),
        }
    }
}

impl Backend for BackendConfig {
    fn backup(&self, sources: &[String], repository: &str, options: &BackendOptions) -> BackupResult {
        self.inner().backup(sources, repository, options)
    }

    fn check(&self, repository: &str, options: &BackendOptions) -> CheckResult {
        self.inner().check(repository, options)
    }

    fn restore(
        &self,
        repository: &str,
        snapshot_id: &str,
        target: &str,
        options: &BackendOptions,
    ) -> RestoreResult {
        self.inner().restore(repository, snapshot_id, target, options)
    }

    fn list_snapshots(&self, repository: &str, options: &BackendOptions) -> Vec<Snapshot> {
        self.inner().list_snapshots(repository, options)
    }

    fn forget(&self, repository: &str, snapshot_ids: &[String], options: &BackendOptions) -> Result<()> {
        self.inner().forget(repository, snapshot_ids, options)
    }

    fn prune(&self, repository: &str, options: &BackendOptions) -> Result<()> {
        self.inner().prune(repository, options)
    }

    fn get_repository_size(&self, repository: &str) -> u64 {
        self.inner().get_repository_size(repository)
    }
}

pub(crate) fn ensure_sources(sources: &[String]) -> Result<()> {
    if sources.is_empty() {
        tracing::error!("Refusing to back up an empty source list");
        Err(Error::empty_sources())
    } else {
        Ok(())
    }
}

/// Healthy summaries that mention the keyword, e.g. restic's "no errors were found".
const NEGATED: [&str; 2] = ["no errors", "no warnings"];

/// Splits check output into (errors, warnings) by case-insensitive keyword.
pub(crate) fn classify_lines(output: &str) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let lower = line.to_lowercase();
        if NEGATED.iter().any(|n| lower.contains(n)) {
            continue;
        }
        if lower.contains("error") {
            errors.push(line.to_string());
        } else if lower.contains("warning") {
            warnings.push(line.to_string());
        }
    }
    (errors, warnings)
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes an executable shell script standing in for an external tool.
    pub fn stub_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Reads the argv a stub recorded with `printf '%s\n' "$@" > FILE`.
    pub fn recorded_args(file: &Path) -> Vec<String> {
        std::fs::read_to_string(file)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
