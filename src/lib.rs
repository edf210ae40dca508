//! # backup_orchestrator
//!
//! Runs backup jobs through external tools and keeps track of how they went.
//!
//! ## Features
//!
//! - **Pluggable Backends**: restic, borg and zfs send/receive behind one [`Backend`](orchestrator::backend::Backend) trait
//! - **Generational Retention**: keep-last, hourly, daily, weekly (ISO), monthly and yearly buckets
//! - **Job Registry**: thread-safe per-job status, metrics and verification results
//! - **Parallel Jobs**: independent jobs run concurrently on a rayon pool
//!
//! ## Quick Start
//!
//! ```no_run
//! use backup_orchestrator::orchestrator::config::OrchestratorConfig;
//! use backup_orchestrator::orchestrator::runner::JobRunner;
//!
//! let config = OrchestratorConfig::load("config.yml")?;
//! let runner = JobRunner::default();
//!
//! let thread_pool = rayon::ThreadPoolBuilder::new().build()?;
//! for outcome in runner.run_jobs(config.jobs(), &thread_pool) {
//!     println!("{}: {}", outcome.job_name, outcome.backup.success);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod orchestrator;
