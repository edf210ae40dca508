use crate::orchestrator::backend::options::BackendOptions;
use crate::orchestrator::backend::BackendConfig;
use crate::orchestrator::result_error::error::Error;
use crate::orchestrator::result_error::result::Result;
use crate::orchestrator::result_error::AddMsg;
use crate::orchestrator::retention::RetentionPolicy;
use crate::orchestrator::validate::{validate_cron_str, validate_job_schedules, validate_unique_job_names};
use bon::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::Path;
use validator::Validate;

fn default_rpo_hours() -> u32 {
    24
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Getters)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_unique_job_names))]
pub struct OrchestratorConfig {
    #[validate(nested)]
    #[getset(get = "pub")]
    jobs: Vec<JobConfig>,
}

/// One backup job: what to back up, where to, with which tool and policy.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Getters, CopyGetters, Builder)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_job_schedules))]
pub struct JobConfig {
    #[validate(length(min = 1))]
    #[getset(get = "pub")]
    #[builder(into)]
    name: String,
    #[validate(nested)]
    #[getset(get = "pub")]
    #[builder(into)]
    backend: BackendConfig,
    #[validate(length(min = 1, message = "No source paths specified"))]
    #[getset(get = "pub")]
    sources: Vec<String>,
    #[getset(get = "pub")]
    #[builder(into)]
    repository: String,
    #[validate(custom(function = validate_cron_str))]
    #[getset(get = "pub")]
    #[builder(into)]
    schedule: String,
    #[getset(get = "pub")]
    #[builder(into)]
    verification_schedule: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    #[getset(get = "pub")]
    #[builder(default)]
    retention: RetentionPolicy,
    #[serde(default)]
    #[getset(get = "pub")]
    #[builder(default)]
    options: BackendOptions,
    #[serde(default = "default_rpo_hours")]
    #[getset(get_copy = "pub")]
    #[builder(default = default_rpo_hours())]
    rpo_hours: u32,
    #[serde(default = "default_enabled")]
    #[getset(get_copy = "pub")]
    #[builder(default = default_enabled())]
    enabled: bool,
}

impl JobConfig {
    pub fn rpo(&self) -> chrono::Duration {
        chrono::Duration::hours(self.rpo_hours.into())
    }
}

impl OrchestratorConfig {
    pub fn new(jobs: Vec<JobConfig>) -> Self {
        Self { jobs }
    }

    /// Reads and validates a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        File::open(path)
            .map_err(Error::from)
            .add_msg(format!("Cannot open config file {path:?}"))
            .and_then(|f| {
                serde_yml::from_reader::<_, OrchestratorConfig>(f)
                    .map_err(Error::from)
                    .add_msg(format!("Parse YAML config failed: {path:?}"))
            })
            .and_then(|config| {
                config
                    .validate()
                    .map_err(Error::from)
                    .map(|_| config)
                    .add_msg(format!("Config validation failed: {path:?}"))
            })
    }

    pub fn find_job(&self, name: &str) -> Result<&JobConfig> {
        self.jobs
            .iter()
            .find(|job| job.name == name)
            .ok_or_else(|| Error::unknown_job(name))
    }

    pub fn enabled_jobs(&self) -> impl Iterator<Item = &JobConfig> {
        self.jobs.iter().filter(|job| job.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
jobs:
  - name: home
    backend: { backend_type: restic, password_env: RESTIC_PASSWORD, timeout: 2h }
    sources: [/home]
    repository: /srv/restic
    schedule: "0 2 * * *"
    verification_schedule: "0 4 * * 0"
    retention: { keep_last: 3, keep_daily: 7 }
    options: { tags: [nightly] }
    rpo_hours: 12
  - name: archive
    backend: { backend_type: borg }
    sources: [/srv/archive, /etc]
    repository: /srv/borg
    schedule: "30 3 * * *"
    enabled: false
  - name: tank
    backend: { backend_type: zfs, zpool_binary: /sbin/zpool }
    sources: [tank/data]
    repository: backup/data
    schedule: "0 * * * *"
"#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = write_config(CONFIG);
        let config = OrchestratorConfig::load(file.path()).unwrap();

        assert_eq!(config.jobs().len(), 3);
        let home = config.find_job("home").unwrap();
        assert_eq!(home.backend().name(), "restic");
        assert_eq!(home.retention().keep_daily, Some(7));
        assert_eq!(home.options().get_list("tags"), vec!["nightly"]);
        assert_eq!(home.rpo(), chrono::Duration::hours(12));
        assert!(home.enabled());

        let archive = config.find_job("archive").unwrap();
        assert_eq!(archive.rpo_hours(), 24);
        assert!(archive.retention().is_empty());
        assert!(!archive.enabled());

        let enabled: Vec<_> = config.enabled_jobs().map(|j| j.name().as_str()).collect();
        assert_eq!(enabled, vec!["home", "tank"]);
    }

    #[test]
    fn test_unknown_job() {
        let file = write_config(CONFIG);
        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert!(matches!(config.find_job("nope"), Err(Error::UnknownJob(name)) if name == "nope"));
    }

    #[test]
    fn test_duplicate_job_names_rejected() {
        let duplicated = format!("{CONFIG}  - name: home\n    backend: {{ backend_type: zfs }}\n    sources: [tank/home]\n    repository: backup/home\n    schedule: \"0 1 * * *\"\n");
        let file = write_config(&duplicated);
        let err = OrchestratorConfig::load(file.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Config validation failed"), "{msg}");
        assert!(msg.contains("home"), "{msg}");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let job = |extra: &str| {
            format!(
                "jobs:\n  - name: x\n    backend: {{ backend_type: borg }}\n    repository: /srv/borg\n{extra}"
            )
        };

        for (case, yaml) in [
            ("empty sources", job("    sources: []\n    schedule: \"0 2 * * *\"\n")),
            ("bad schedule", job("    sources: [/home]\n    schedule: \"whenever\"\n")),
            (
                "bad verification schedule",
                job("    sources: [/home]\n    schedule: \"0 2 * * *\"\n    verification_schedule: \"61 * * * *\"\n"),
            ),
        ] {
            let file = write_config(&yaml);
            let err = OrchestratorConfig::load(file.path()).unwrap_err();
            assert!(err.to_string().contains("Config validation failed"), "{case}: {err}");
        }
    }

    #[test]
    fn test_malformed_yaml_and_missing_file() {
        let file = write_config("jobs:\n  - name: x\n    backend: { backend_type: tarsnap }\n");
        let err = OrchestratorConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Parse YAML config failed"));

        let err = OrchestratorConfig::load("/nonexistent/config.yml").unwrap_err();
        assert!(err.to_string().contains("Cannot open config file"));
    }

    #[test]
    fn test_builder_defaults() {
        let job = JobConfig::builder()
            .name("home")
            .backend(BackendConfig::Zfs(Default::default()))
            .sources(vec!["tank/home".into()])
            .repository("backup/home")
            .schedule("0 2 * * *")
            .build();
        assert_eq!(job.rpo_hours(), 24);
        assert!(job.enabled());
        assert!(job.validate().is_ok());
        assert!(OrchestratorConfig::new(vec![job.clone(), job]).validate().is_err());
    }
}
