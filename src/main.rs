use backup_orchestrator::orchestrator::config::OrchestratorConfig;
use backup_orchestrator::orchestrator::job::JobRegistry;
use backup_orchestrator::orchestrator::result_error::error::Error;
use backup_orchestrator::orchestrator::result_error::result::Result;
use backup_orchestrator::orchestrator::result_error::AddMsg;
use backup_orchestrator::orchestrator::runner::JobRunner;
use clap::{Parser, Subcommand};
use rayon::ThreadPoolBuilder;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info, Level};

/// Run backup jobs through restic, borg or zfs and report their state
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,

    /// trace, debug, info, warn or error
    #[arg(short, long, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Only load and validate the config file
    Validate,
    /// Print the configured jobs
    ListJobs,
    /// Back up one job now, then apply its retention policy
    Exec { job: String },
    /// Check the repository of one job
    Verify { job: String },
    /// Run every enabled job once, concurrently
    Run,
}

fn print_states(registry: &JobRegistry) -> Result<()> {
    let states = serde_json::to_string_pretty(&registry.all_states())?;
    println!("{states}");
    Ok(())
}

/// `Ok(false)` when a job ran but did not succeed.
fn run(args: Args) -> Result<bool> {
    let config = OrchestratorConfig::load(&args.config)?;
    let runner = JobRunner::new(Arc::new(JobRegistry::new()));

    let succeeded = match args.command {
        Command::Validate => {
            println!("{:?} is valid, {} job(s)", args.config, config.jobs().len());
            true
        }
        Command::ListJobs => {
            for job in config.jobs() {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    job.name(),
                    job.backend().name(),
                    job.repository(),
                    job.schedule(),
                    if job.enabled() { "enabled" } else { "disabled" }
                );
            }
            true
        }
        Command::Exec { job } => {
            let job = config.find_job(&job)?;
            let outcome = runner.run_job(job);
            print_states(runner.registry())?;
            outcome.backup.success && outcome.retention_error.is_none()
        }
        Command::Verify { job } => {
            let job = config.find_job(&job)?;
            let result = runner.run_verification(job);
            print_states(runner.registry())?;
            result.success
        }
        Command::Run => {
            let thread_pool = ThreadPoolBuilder::new()
                .build()
                .map_err(Error::from)
                .add_msg("Cannot build job thread pool")?;
            let outcomes = runner.run_jobs(config.jobs(), &thread_pool);
            print_states(runner.registry())?;
            info!("{} job(s) finished", outcomes.len());
            outcomes
                .iter()
                .all(|o| o.backup.success && o.retention_error.is_none())
        }
    };

    Ok(succeeded)
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    match run(args) {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            error!("{e}");
            exit(2);
        }
    }
}
