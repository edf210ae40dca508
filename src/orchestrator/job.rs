//! Per-job execution state, shared by every worker through a [`JobRegistry`].

use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    #[display("idle")]
    Idle,
    #[display("running")]
    Running,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
    #[display("verifying")]
    Verifying,
}

/// Read-only copy of a job's state. Only the registry mutates the original.
#[derive(Clone, Debug, PartialEq, Serialize, Getters, CopyGetters)]
pub struct JobState {
    #[getset(get = "pub")]
    job_name: String,
    #[getset(get_copy = "pub")]
    status: JobStatus,
    #[getset(get_copy = "pub")]
    last_run: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    last_success: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    last_verification: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    duration_seconds: f64,
    #[getset(get_copy = "pub")]
    bytes_transferred: u64,
    #[getset(get_copy = "pub")]
    repository_size_bytes: u64,
    #[getset(get = "pub")]
    error_message: Option<String>,
    /// Only ever grows
    #[getset(get_copy = "pub")]
    error_count: u64,
    #[getset(get_copy = "pub")]
    verification_success: bool,
    #[getset(get = "pub")]
    metadata: BTreeMap<String, String>,
}

impl JobState {
    fn new<S: Into<String>>(job_name: S) -> Self {
        Self {
            job_name: job_name.into(),
            status: JobStatus::Idle,
            last_run: None,
            last_success: None,
            last_verification: None,
            duration_seconds: 0.0,
            bytes_transferred: 0,
            repository_size_bytes: 0,
            error_message: None,
            error_count: 0,
            verification_success: true,
            metadata: BTreeMap::new(),
        }
    }

    fn update_success(&mut self, duration: Duration, bytes_transferred: u64, repository_size: u64) {
        let now = Utc::now();
        self.status = JobStatus::Success;
        self.last_run = Some(now);
        self.last_success = Some(now);
        self.duration_seconds = duration.as_secs_f64();
        self.bytes_transferred = bytes_transferred;
        // zero means the size query could not answer, keep the last known value
        if repository_size > 0 {
            self.repository_size_bytes = repository_size;
        }
        self.error_message = None;
    }

    fn update_failure(&mut self, message: String) {
        self.status = JobStatus::Failed;
        self.last_run = Some(Utc::now());
        self.error_message = Some(message);
        self.error_count += 1;
    }

    fn update_verification(&mut self, success: bool, message: Option<String>) {
        self.last_verification = Some(Utc::now());
        self.verification_success = success;
        if !success {
            self.error_message = Some(message.unwrap_or_else(|| "verification failed".to_string()));
        }
    }

    /// True when the job has never succeeded or its last success is older than `rpo`.
    pub fn rpo_breached(&self, rpo: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.last_success {
            None => true,
            Some(last_success) => now.signed_duration_since(last_success) > rpo,
        }
    }
}

/// Job name to state map behind a single lock.
///
/// Every call holds the lock for its whole duration, so each call is atomic and
/// calls on the same job are totally ordered. A sequence of calls is not atomic.
/// Mutating calls create the job on first use.
#[derive(Debug, Default)]
pub struct JobRegistry {
    states: Mutex<HashMap<String, JobState>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, job_name: &str, f: impl FnOnce(&mut JobState) -> R) -> R {
        let mut states = self.states.lock();
        let state = states
            .entry(job_name.to_string())
            .or_insert_with(|| JobState::new(job_name));
        f(state)
    }

    /// Idempotent, an existing state is left untouched.
    pub fn register(&self, job_name: &str) {
        self.with_state(job_name, |_| ());
    }

    pub fn get(&self, job_name: &str) -> Option<JobState> {
        self.states.lock().get(job_name).cloned()
    }

    pub fn update_success(
        &self,
        job_name: &str,
        duration: Duration,
        bytes_transferred: u64,
        repository_size: u64,
    ) {
        self.with_state(job_name, |s| {
            s.update_success(duration, bytes_transferred, repository_size)
        });
    }

    pub fn update_failure<S: Into<String>>(&self, job_name: &str, message: S) {
        let message = message.into();
        self.with_state(job_name, |s| s.update_failure(message));
    }

    /// Touches only the verification track, plus `error_message` on failure.
    pub fn update_verification(&self, job_name: &str, success: bool, message: Option<String>) {
        self.with_state(job_name, |s| s.update_verification(success, message));
    }

    pub fn set_status(&self, job_name: &str, status: JobStatus) {
        self.with_state(job_name, |s| s.status = status);
    }

    /// Swaps the status and returns the previous one in a single call.
    pub fn replace_status(&self, job_name: &str, status: JobStatus) -> JobStatus {
        self.with_state(job_name, |s| std::mem::replace(&mut s.status, status))
    }

    /// Sets `status` only if the job is still at `expected`, returns whether it did.
    pub fn restore_status_if(&self, job_name: &str, expected: JobStatus, status: JobStatus) -> bool {
        self.with_state(job_name, |s| {
            let matches = s.status == expected;
            if matches {
                s.status = status;
            }
            matches
        })
    }

    pub fn set_metadata<K: Into<String>, V: Into<String>>(&self, job_name: &str, key: K, value: V) {
        let (key, value) = (key.into(), value.into());
        self.with_state(job_name, |s| {
            s.metadata.insert(key, value);
        });
    }

    /// Copies of every state, ordered by job name.
    pub fn all_states(&self) -> BTreeMap<String, JobState> {
        self.states
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.states.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_register_is_idempotent() {
        let registry = JobRegistry::new();
        assert!(registry.get("home").is_none());

        registry.register("home");
        registry.update_failure("home", "boom");
        registry.register("home");

        let state = registry.get("home").unwrap();
        assert_eq!(state.job_name(), "home");
        assert_eq!(state.status(), JobStatus::Failed);
        assert_eq!(state.error_count(), 1);
    }

    #[test]
    fn test_new_state_defaults() {
        let registry = JobRegistry::new();
        registry.register("home");
        let state = registry.get("home").unwrap();
        assert_eq!(state.status(), JobStatus::Idle);
        assert!(state.last_run().is_none());
        assert!(state.verification_success());
        assert_eq!(state.error_count(), 0);
        assert!(state.metadata().is_empty());
    }

    #[test]
    fn test_success_failure_success_sequence() {
        let registry = JobRegistry::new();
        registry.update_success("home", Duration::from_millis(1500), 100, 1000);
        let first = registry.get("home").unwrap();
        assert_eq!(first.status(), JobStatus::Success);
        assert_eq!(first.duration_seconds(), 1.5);
        assert_eq!(first.last_run(), first.last_success());

        registry.update_failure("home", "repository locked");
        let failed = registry.get("home").unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);
        assert_eq!(failed.error_count(), 1);
        assert_eq!(failed.error_message().as_deref(), Some("repository locked"));
        assert_eq!(failed.last_success(), first.last_success());

        registry.update_success("home", Duration::from_secs(2), 50, 1200);
        let recovered = registry.get("home").unwrap();
        assert_eq!(recovered.status(), JobStatus::Success);
        assert!(recovered.error_message().is_none());
        assert_eq!(recovered.error_count(), 1);
        assert_eq!(recovered.bytes_transferred(), 50);
        assert_eq!(recovered.repository_size_bytes(), 1200);
    }

    #[test]
    fn test_zero_size_does_not_clobber_known_size() {
        let registry = JobRegistry::new();
        registry.update_success("home", Duration::ZERO, 10, 4096);
        registry.update_success("home", Duration::ZERO, 20, 0);
        assert_eq!(registry.get("home").unwrap().repository_size_bytes(), 4096);
    }

    #[test]
    fn test_verification_track_is_independent() {
        let registry = JobRegistry::new();
        registry.update_failure("home", "backup failed");
        registry.set_status("home", JobStatus::Verifying);

        registry.update_verification("home", true, None);
        let state = registry.get("home").unwrap();
        assert!(state.verification_success());
        assert!(state.last_verification().is_some());
        assert_eq!(state.error_message().as_deref(), Some("backup failed"));
        assert_eq!(state.status(), JobStatus::Verifying);

        registry.update_verification("home", false, Some("pack 12 damaged".into()));
        let state = registry.get("home").unwrap();
        assert!(!state.verification_success());
        assert_eq!(state.error_message().as_deref(), Some("pack 12 damaged"));
        assert_eq!(state.error_count(), 1);

        registry.update_verification("other", false, None);
        let other = registry.get("other").unwrap();
        assert_eq!(other.error_message().as_deref(), Some("verification failed"));
        assert_eq!(other.status(), JobStatus::Idle);
    }

    #[test]
    fn test_replace_status_and_metadata() {
        let registry = JobRegistry::new();
        registry.update_success("home", Duration::ZERO, 0, 0);
        assert_eq!(registry.replace_status("home", JobStatus::Verifying), JobStatus::Success);
        assert_eq!(registry.get("home").unwrap().status(), JobStatus::Verifying);

        registry.set_metadata("home", "snapshot_id", "abc123");
        assert_eq!(registry.get("home").unwrap().metadata()["snapshot_id"], "abc123");
    }

    #[test]
    fn test_restore_status_if_leaves_newer_status_alone() {
        let registry = JobRegistry::new();
        let previous = registry.replace_status("home", JobStatus::Verifying);
        assert!(registry.restore_status_if("home", JobStatus::Verifying, previous));
        assert_eq!(registry.get("home").unwrap().status(), JobStatus::Idle);

        let previous = registry.replace_status("home", JobStatus::Verifying);
        registry.update_success("home", Duration::ZERO, 0, 0);
        assert!(!registry.restore_status_if("home", JobStatus::Verifying, previous));
        assert_eq!(registry.get("home").unwrap().status(), JobStatus::Success);
    }

    #[test]
    fn test_copies_are_detached() {
        let registry = JobRegistry::new();
        registry.register("home");
        let before = registry.get("home").unwrap();
        registry.update_failure("home", "boom");
        assert_eq!(before.status(), JobStatus::Idle);
    }

    #[test]
    fn test_all_states_and_clear() {
        let registry = JobRegistry::new();
        registry.register("b");
        registry.register("a");
        let names: Vec<_> = registry.all_states().into_keys().collect();
        assert_eq!(names, vec!["a", "b"]);

        registry.clear();
        assert!(registry.all_states().is_empty());
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn test_rpo_breached() {
        let registry = JobRegistry::new();
        registry.register("home");
        let rpo = chrono::Duration::hours(24);
        assert!(registry.get("home").unwrap().rpo_breached(rpo, Utc::now()));

        registry.update_success("home", Duration::ZERO, 0, 0);
        let state = registry.get("home").unwrap();
        let last = state.last_success().unwrap();
        assert!(!state.rpo_breached(rpo, last + chrono::Duration::hours(23)));
        assert!(state.rpo_breached(rpo, last + chrono::Duration::hours(25)));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(JobStatus::Verifying.to_string(), "verifying");
        assert_eq!(serde_json::to_value(JobStatus::Failed).unwrap(), "failed");
    }

    fn assert_consistent(state: &JobState) {
        match state.status() {
            JobStatus::Success => assert!(state.error_message().is_none()),
            JobStatus::Failed => assert!(state.error_message().is_some()),
            _ => {}
        }
        // successes write bytes = 10 * size, torn updates would break the pairing
        if state.repository_size_bytes() > 0 {
            assert_eq!(state.bytes_transferred(), state.repository_size_bytes() * 10);
        }
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        const THREADS: u64 = 8;
        const UPDATES: u64 = 200;
        let registry = JobRegistry::new();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    if let Some(state) = registry.get("shared") {
                        assert_consistent(&state);
                    }
                }
            });

            let writers: Vec<_> = (0..THREADS)
                .map(|t| {
                    let registry = &registry;
                    scope.spawn(move || {
                        for i in 0..UPDATES {
                            if i % 2 == 0 {
                                let size = t * UPDATES + i + 1;
                                registry.update_success("shared", Duration::from_millis(i), size * 10, size);
                            } else {
                                registry.update_failure("shared", format!("writer {t} update {i}"));
                            }
                        }
                    })
                })
                .collect();

            for writer in writers {
                writer.join().unwrap();
            }
            done.store(true, Ordering::Relaxed);
            reader.join().unwrap();
        });

        let state = registry.get("shared").unwrap();
        assert_eq!(state.error_count(), THREADS * UPDATES / 2);
        assert_consistent(&state);
    }

    #[test]
    fn test_concurrent_jobs_on_rayon_pool() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let registry = JobRegistry::new();

        pool.install(|| {
            (0..400u64).into_par_iter().for_each(|i| {
                let job = format!("job-{}", i % 10);
                registry.set_status(&job, JobStatus::Running);
                registry.update_failure(&job, "boom");
            });
        });

        let states = registry.all_states();
        assert_eq!(states.len(), 10);
        assert!(states.values().all(|s| s.error_count() == 40));
        assert!(states.values().all(|s| s.status() == JobStatus::Failed));
    }
}
