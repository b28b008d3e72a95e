//! Core library: the scheduler, job store, resource ledger, and supervisor
//! abstraction. `main.rs` is a thin CLI dispatcher over these operations.
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod job;
pub(crate) mod ledger;
pub(crate) mod lock;
pub(crate) mod paths;
pub(crate) mod scheduler;
pub(crate) mod supervisor;

pub use error::{JqsError, Result};

use std::env;

pub use config::Config;
pub use job::{Job, JobState, Requirements};
pub use ledger::{Ledger, Limits, Usage};
pub use paths::PathStore;
pub use scheduler::{CycleReport, Scheduler};
pub use supervisor::SystemdSupervisor;

use job::{parse_script_header, JobStore};

/// Resolve the base directory the way the CLI does: an explicit `--dir`
/// override, else `PathStore::open`'s own `JQS_HOME`/`~/.jqs` resolution.
pub fn open_paths(dir_override: Option<std::path::PathBuf>) -> std::io::Result<PathStore> {
    match dir_override {
        Some(dir) => PathStore::at(dir),
        None => PathStore::open(),
    }
}

/// `USER` environment variable, defaulting to "unknown".
pub fn current_user() -> String {
    env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

/// Read a script, parse its `#JS` header, and register a new PENDING job.
pub fn submit(paths: &PathStore, script_path: &std::path::Path) -> Result<String> {
    let contents = std::fs::read_to_string(script_path)
        .map_err(|e| JqsError::io(script_path.to_path_buf(), e))?;
    let header = parse_script_header(&contents, script_path)?;
    let jobs = JobStore::new(paths.clone());
    jobs.create(script_path, header, current_user())
}

/// Construct the production scheduler against the real filesystem and
/// `systemd-run`/`systemctl`.
pub fn production_scheduler(paths: PathStore) -> Scheduler<SystemdSupervisor> {
    let config = Config::load(&paths);
    let jobs = JobStore::new(paths.clone());
    let ledger = Ledger::new(paths);
    Scheduler::new(jobs, ledger, SystemdSupervisor, config.history_keep())
}

pub fn poll_interval(paths: &PathStore) -> std::time::Duration {
    std::time::Duration::from_secs(Config::load(paths).poll_interval_sec())
}

/// Look up a job by ID, searching queue/running/finished in that order.
pub fn read_job(paths: &PathStore, job_id: &str) -> Result<Option<Job>> {
    JobStore::new(paths.clone()).read(job_id)
}

/// Queue view for the `q` subcommand: PENDING+RUNNING jobs sorted by
/// `submit_time` ascending, and up to the 20 most recently finished jobs
/// sorted by `end_time` descending. Built on [`JobStore::list_all`], then
/// split and truncated for display.
pub fn queue_view(paths: &PathStore) -> (Vec<Job>, Vec<Job>) {
    let all = JobStore::new(paths.clone()).list_all();

    let mut active: Vec<Job> = all.iter().filter(|j| !j.state.is_terminal()).cloned().collect();
    active.sort_by(|a, b| a.submit_time.cmp(&b.submit_time));

    let mut finished: Vec<Job> = all.into_iter().filter(|j| j.state.is_terminal()).collect();
    finished.sort_by(|a, b| b.end_time.cmp(&a.end_time));
    finished.truncate(20);

    (active, finished)
}

/// `{limits, usage}` report for the `nodes` subcommand.
pub fn node_report(paths: &PathStore) -> Result<(Limits, Usage)> {
    let ledger = Ledger::new(paths.clone());
    Ok((ledger.limits()?, ledger.usage()?))
}

/// Cancel a job through the full procedure, including `Supervisor.stop`
/// for a RUNNING job, using the production supervisor.
pub fn cancel(paths: PathStore, job_id: &str) -> Result<()> {
    production_scheduler(paths).cancel(job_id)
}
