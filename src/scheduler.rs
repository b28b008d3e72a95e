//! The control loop: reconcile running jobs, admit pending
//! ones FIFO under the resource ledger, trim finished history. Phase order
//! within a cycle is fixed and must not change.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{JqsError, Result};
use crate::job::{Job, JobState, JobStore};
use crate::ledger::Ledger;
use crate::supervisor::{resolve_io_path, LaunchOutcome, LaunchParams, Supervisor};

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub completed: usize,
    pub scheduled: usize,
    pub cleaned: usize,
}

pub struct Scheduler<S: Supervisor> {
    jobs: JobStore,
    ledger: Ledger,
    supervisor: S,
    history_keep: usize,
}

impl<S: Supervisor> Scheduler<S> {
    pub fn new(jobs: JobStore, ledger: Ledger, supervisor: S, history_keep: usize) -> Self {
        Self {
            jobs,
            ledger,
            supervisor,
            history_keep,
        }
    }

    /// Run one pass: reconcile running → admit pending → trim history, in
    /// that fixed order.
    pub fn cycle(&self) -> Result<CycleReport> {
        let completed = self.reconcile_running()?;
        let scheduled = self.admit_pending()?;
        let cleaned = self.trim_history()?;

        if completed > 0 || scheduled > 0 || cleaned > 0 {
            info!(
                "cycle: {completed} completed, {scheduled} scheduled, {cleaned} cleaned from history"
            );
        }

        Ok(CycleReport {
            completed,
            scheduled,
            cleaned,
        })
    }

    /// Loop calling `cycle()`, sleeping `poll_interval` between passes,
    /// until an interrupt is observed between cycles.
    pub fn run(&self, poll_interval: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
        loop {
            self.cycle()?;
            if shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested, exiting cleanly");
                return Ok(());
            }
            thread::sleep(poll_interval);
            if shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested, exiting cleanly");
                return Ok(());
            }
        }
    }

    fn reconcile_running(&self) -> Result<usize> {
        let mut completed = 0;
        for job in self.jobs.list_running() {
            match self.reconcile_one(&job) {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => warn!("reconcile of job {} failed: {e}", job.job_id),
            }
        }
        Ok(completed)
    }

    fn reconcile_one(&self, job: &Job) -> Result<bool> {
        let unit = job
            .unit_name
            .as_deref()
            .ok_or_else(|| JqsError::NotFound(job.job_id.clone()))?;

        let (new_state, exit_code, notes) = match self.supervisor.status(unit) {
            Some(status) if status.is_terminal() => {
                let code = status.exit_code();
                let state = if code == 0 {
                    JobState::Completed
                } else {
                    JobState::Failed
                };
                (state, code, None)
            }
            Some(_) => return Ok(false), // still running
            None => {
                let err = JqsError::SupervisorStatusFailed(unit.to_string());
                warn!("{err}");
                (JobState::Failed, -1, Some(err.to_string()))
            }
        };

        self.jobs.update(&job.job_id, new_state, |j| {
            j.exit_code = Some(exit_code);
            if let Some(note) = &notes {
                j.notes = Some(note.clone());
            }
        })?;
        self.jobs
            .move_to(&job.job_id, &self.jobs.paths().finished_dir())?;
        self.ledger.apply_delta(-job.req.cores, -job.req.mem_mb)?;

        debug!("job {} reconciled to {new_state}", job.job_id);
        Ok(true)
    }

    /// Snapshot available capacity once, walk PENDING jobs FIFO
    /// (submit_time, then job_id), admitting every job that currently fits
    /// without causing a non-fitting job to block smaller ones behind it
    /// ("first-fit-at-head").
    fn admit_pending(&self) -> Result<usize> {
        let limits = self.ledger.limits()?;
        let usage = self.ledger.usage()?;
        let mut available_cores = limits.cores_total - usage.cores_used;
        let mut available_mem = limits.mem_mb_total - usage.mem_mb_used;

        let mut pending = self.jobs.list_pending();
        pending.sort_by(|a, b| {
            a.submit_time
                .cmp(&b.submit_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });

        let mut scheduled = 0;
        for job in pending {
            if job.req.cores <= available_cores && job.req.mem_mb <= available_mem {
                match self.launch_one(&job) {
                    Ok(true) => {
                        available_cores -= job.req.cores;
                        available_mem -= job.req.mem_mb;
                        scheduled += 1;
                    }
                    Ok(false) => {} // rolled back to FAILED, capacity untouched
                    Err(e) => warn!("launch of job {} failed: {e}", job.job_id),
                }
            }
        }
        Ok(scheduled)
    }

    /// `update(RUNNING)` → `Supervisor.launch` → on success `move(running/)`
    /// then `Ledger.apply_delta(+)`; on failure roll back to FAILED with no
    /// ledger delta.
    fn launch_one(&self, job: &Job) -> Result<bool> {
        let updated = self.jobs.update(&job.job_id, JobState::Running, |_| {})?;
        let unit = updated
            .unit_name
            .clone()
            .unwrap_or_else(|| format!("jqs-job-{}", job.job_id));
        let workdir = std::path::Path::new(&updated.workdir);
        let stdout_path = resolve_io_path(&updated.io.stdout, &updated.name, &job.job_id, workdir);
        let stderr_path = resolve_io_path(&updated.io.stderr, &updated.name, &job.job_id, workdir);
        let script_path = self.queued_script_path(&job.job_id);

        let outcome = self.supervisor.launch(LaunchParams {
            unit: &unit,
            cores: job.req.cores,
            mem_mb: job.req.mem_mb,
            workdir,
            stdout_path: &stdout_path,
            stderr_path: &stderr_path,
            time_limit: job.req.time_limit.as_deref(),
            script_path: &script_path,
        });

        match outcome {
            LaunchOutcome::Launched => {
                self.jobs
                    .move_to(&job.job_id, &self.jobs.paths().running_dir())?;
                self.ledger.apply_delta(job.req.cores, job.req.mem_mb)?;
                debug!("job {} launched as unit {unit}", job.job_id);
                Ok(true)
            }
            LaunchOutcome::Failed(code) => {
                self.jobs
                    .update(&job.job_id, JobState::Failed, |j| j.exit_code = Some(code))?;
                self.jobs
                    .move_to(&job.job_id, &self.jobs.paths().finished_dir())?;
                let err = JqsError::SupervisorLaunchFailed {
                    unit: unit.clone(),
                    code,
                };
                warn!("job {}: {err}", job.job_id);
                Ok(false)
            }
        }
    }

    /// The script still lives under `queue/<id>/script.sh` at the moment of
    /// launch since `update` precedes `move`.
    fn queued_script_path(&self, job_id: &str) -> std::path::PathBuf {
        self.jobs
            .paths()
            .queue_dir()
            .join(job_id)
            .join(crate::job::SCRIPT_FILE)
    }

    /// Sort finished jobs by `end_time` ascending, keep the newest
    /// `history_keep`, remove the rest recursively. Jobs without an
    /// `end_time` are excluded from the sort entirely.
    fn trim_history(&self) -> Result<usize> {
        let mut finished: Vec<Job> = self
            .jobs
            .list_finished()
            .into_iter()
            .filter(|j| j.end_time.is_some())
            .collect();
        finished.sort_by(|a, b| a.end_time.cmp(&b.end_time));

        let remove_count = finished.len().saturating_sub(self.history_keep);
        let mut cleaned = 0;
        for job in finished.into_iter().take(remove_count) {
            let dir = self.jobs.paths().finished_dir().join(&job.job_id);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => cleaned += 1,
                Err(e) => warn!("failed to remove finished job {}: {e}", job.job_id),
            }
        }
        Ok(cleaned)
    }

    /// External entry point invoked by the CLI `cancel` subcommand.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let job = self
            .jobs
            .read(job_id)?
            .ok_or_else(|| JqsError::NotFound(job_id.to_string()))?;

        if job.state.is_terminal() {
            return Ok(());
        }

        if job.state == JobState::Pending {
            self.jobs.update(job_id, JobState::Cancelled, |_| {})?;
            self.jobs
                .move_to(job_id, &self.jobs.paths().finished_dir())?;
            return Ok(());
        }

        self.jobs.update(job_id, JobState::Cancelled, |_| {})?;
        if let Some(unit) = &job.unit_name {
            if !self.supervisor.stop(unit) {
                let err = JqsError::SupervisorStopFailed(unit.clone());
                warn!("job {job_id}: {err}");
            }
        }
        self.jobs
            .move_to(job_id, &self.jobs.paths().finished_dir())?;
        self.ledger.apply_delta(-job.req.cores, -job.req.mem_mb)?;
        Ok(())
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::parse_script_header;
    use crate::paths::PathStore;
    use crate::supervisor::{ActiveState, FakeSupervisor, SubState, UnitStatus};
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Scheduler<FakeSupervisor>) {
        let dir = TempDir::new().unwrap();
        let paths = PathStore::at(dir.path().to_path_buf()).unwrap();
        let jobs = JobStore::new(paths.clone());
        let ledger = Ledger::new(paths.clone());
        fs::write(
            paths.limits_file(),
            r#"{"cores_total":4,"mem_mb_total":4096}"#,
        )
        .unwrap();
        let sched = Scheduler::new(jobs, ledger, FakeSupervisor::new(), 100);
        (dir, sched)
    }

    fn submit(dir: &TempDir, sched: &Scheduler<FakeSupervisor>, header: &str, name: &str) -> String {
        let script_path = dir.path().join(format!("{name}.sh"));
        fs::write(&script_path, header).unwrap();
        let parsed = parse_script_header(header, &script_path).unwrap();
        sched
            .jobs()
            .create(&script_path, parsed, "tester".to_string())
            .unwrap()
    }

    #[test]
    fn s1_submit_and_run_to_completion() {
        let (dir, sched) = setup();
        let id = submit(&dir, &sched, "#JS cores=2 mem_mb=1024 name=a\necho hi\n", "a");

        let job = sched.jobs().read(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);

        sched.cycle().unwrap();
        let job = sched.jobs().read(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.start_time.is_some());
        assert_eq!(job.unit_name.as_deref(), Some(format!("jqs-job-{id}").as_str()));
        let usage = sched.ledger().usage().unwrap();
        assert_eq!((usage.cores_used, usage.mem_mb_used), (2, 1024));

        let unit = job.unit_name.clone().unwrap();
        // access the fake via a second cycle after scripting completion
        let fake = FakeSupervisor::new();
        fake.set_status(
            &unit,
            UnitStatus {
                active_state: ActiveState::Inactive,
                sub_state: SubState::Exited,
                exit_status: Some(0),
            },
        );
        // rebuild scheduler sharing the same store but the scripted fake
        let sched2 = Scheduler::new(
            JobStore::new(sched.jobs().paths().clone()),
            Ledger::new(sched.jobs().paths().clone()),
            fake,
            100,
        );
        sched2.cycle().unwrap();
        let job = sched2.jobs().read(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.exit_code, Some(0));
        let usage = sched2.ledger().usage().unwrap();
        assert_eq!((usage.cores_used, usage.mem_mb_used), (0, 0));
    }

    #[test]
    fn s2_resource_constrained_fifo() {
        let (dir, sched) = setup();
        let j1 = submit(&dir, &sched, "#JS cores=4\necho 1\n", "j1");
        let j2 = submit(&dir, &sched, "#JS cores=2\necho 2\n", "j2");

        sched.cycle().unwrap();
        assert_eq!(sched.jobs().read(&j1).unwrap().unwrap().state, JobState::Running);
        assert_eq!(sched.jobs().read(&j2).unwrap().unwrap().state, JobState::Pending);
    }

    #[test]
    fn s2_cycle_three_reconciles_completion_and_admits_next_job_same_cycle() {
        let (dir, sched) = setup();
        let j1 = submit(&dir, &sched, "#JS cores=4\necho 1\n", "j1");
        let j2 = submit(&dir, &sched, "#JS cores=2\necho 2\n", "j2");

        sched.cycle().unwrap(); // cycle 1: j1 admitted, j2 blocked (0 cores free)
        assert_eq!(sched.jobs().read(&j1).unwrap().unwrap().state, JobState::Running);
        assert_eq!(sched.jobs().read(&j2).unwrap().unwrap().state, JobState::Pending);

        sched.cycle().unwrap(); // cycle 2: j1 still running, j2 still blocked
        assert_eq!(sched.jobs().read(&j1).unwrap().unwrap().state, JobState::Running);
        assert_eq!(sched.jobs().read(&j2).unwrap().unwrap().state, JobState::Pending);

        let unit = sched.jobs().read(&j1).unwrap().unwrap().unit_name.unwrap();
        sched.supervisor().set_status(
            &unit,
            UnitStatus {
                active_state: ActiveState::Inactive,
                sub_state: SubState::Exited,
                exit_status: Some(0),
            },
        );

        let report = sched.cycle().unwrap(); // cycle 3: j1 reconciled and j2 admitted together
        assert_eq!(report.completed, 1);
        assert_eq!(report.scheduled, 1);
        assert_eq!(sched.jobs().read(&j1).unwrap().unwrap().state, JobState::Completed);
        assert_eq!(sched.jobs().read(&j2).unwrap().unwrap().state, JobState::Running);
        let usage = sched.ledger().usage().unwrap();
        assert_eq!((usage.cores_used, usage.mem_mb_used), (2, 1024));
    }

    #[test]
    fn s3_first_fit_at_head_lets_smaller_job_pass() {
        let (dir, sched) = setup();
        let j1 = submit(&dir, &sched, "#JS cores=8\necho 1\n", "j1"); // never fits
        let j2 = submit(&dir, &sched, "#JS cores=2\necho 2\n", "j2");

        sched.cycle().unwrap();
        assert_eq!(sched.jobs().read(&j1).unwrap().unwrap().state, JobState::Pending);
        assert_eq!(sched.jobs().read(&j2).unwrap().unwrap().state, JobState::Running);
        let usage = sched.ledger().usage().unwrap();
        assert_eq!(usage.cores_used, 2);
    }

    #[test]
    fn s4_cancel_running_releases_resources() {
        let (dir, sched) = setup();
        let id = submit(&dir, &sched, "#JS cores=2 mem_mb=1024\necho hi\n", "j");
        sched.cycle().unwrap();
        assert_eq!(sched.jobs().read(&id).unwrap().unwrap().state, JobState::Running);

        sched.cancel(&id).unwrap();
        let job = sched.jobs().read(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.end_time.is_some());
        let usage = sched.ledger().usage().unwrap();
        assert_eq!((usage.cores_used, usage.mem_mb_used), (0, 0));
    }

    #[test]
    fn s5_supervisor_disappearance_marks_failed() {
        let (dir, sched) = setup();
        let id = submit(&dir, &sched, "#JS cores=2 mem_mb=1024\necho hi\n", "j");
        sched.cycle().unwrap();
        let job = sched.jobs().read(&id).unwrap().unwrap();
        let unit = job.unit_name.clone().unwrap();

        let fake = FakeSupervisor::new();
        fake.make_unit_disappear(&unit);
        let sched2 = Scheduler::new(
            JobStore::new(sched.jobs().paths().clone()),
            Ledger::new(sched.jobs().paths().clone()),
            fake,
            100,
        );
        sched2.cycle().unwrap();

        let job = sched2.jobs().read(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.exit_code, Some(-1));
        assert!(job.notes.is_some());
        let usage = sched2.ledger().usage().unwrap();
        assert_eq!((usage.cores_used, usage.mem_mb_used), (0, 0));
    }

    #[test]
    fn s6_history_trim_keeps_newest_n() {
        let dir = TempDir::new().unwrap();
        let paths = PathStore::at(dir.path().to_path_buf()).unwrap();
        let jobs = JobStore::new(paths.clone());
        let ledger = Ledger::new(paths.clone());
        let sched = Scheduler::new(jobs, ledger, FakeSupervisor::new(), 2);

        for i in 0..5 {
            let script_path = dir.path().join(format!("j{i}.sh"));
            fs::write(&script_path, "echo hi\n").unwrap();
            let parsed = parse_script_header("echo hi\n", &script_path).unwrap();
            let id = sched
                .jobs()
                .create(&script_path, parsed, "tester".to_string())
                .unwrap();
            sched
                .jobs()
                .update(&id, JobState::Completed, |j| {
                    j.end_time = Some(format!("2026-01-0{}T00:00:00+00:00", i + 1));
                    j.exit_code = Some(0);
                })
                .unwrap();
            sched
                .jobs()
                .move_to(&id, &sched.jobs().paths().finished_dir())
                .unwrap();
        }

        let report = sched.cycle().unwrap();
        assert_eq!(report.cleaned, 3);
        assert_eq!(sched.jobs().list_finished().len(), 2);
    }

    #[test]
    fn boundary_history_keep_zero_retains_no_finished_jobs() {
        let dir = TempDir::new().unwrap();
        let paths = PathStore::at(dir.path().to_path_buf()).unwrap();
        let jobs = JobStore::new(paths.clone());
        let ledger = Ledger::new(paths.clone());
        let sched = Scheduler::new(jobs, ledger, FakeSupervisor::new(), 0);

        for i in 0..3 {
            let script_path = dir.path().join(format!("j{i}.sh"));
            fs::write(&script_path, "echo hi\n").unwrap();
            let parsed = parse_script_header("echo hi\n", &script_path).unwrap();
            let id = sched
                .jobs()
                .create(&script_path, parsed, "tester".to_string())
                .unwrap();
            sched
                .jobs()
                .update(&id, JobState::Completed, |j| {
                    j.end_time = Some(format!("2026-01-0{}T00:00:00+00:00", i + 1));
                    j.exit_code = Some(0);
                })
                .unwrap();
            sched
                .jobs()
                .move_to(&id, &sched.jobs().paths().finished_dir())
                .unwrap();
        }

        let report = sched.cycle().unwrap();
        assert_eq!(report.cleaned, 3);
        assert_eq!(sched.jobs().list_finished().len(), 0);
    }

    #[test]
    fn boundary_exact_fit_is_admitted() {
        let (dir, sched) = setup();
        let id = submit(&dir, &sched, "#JS cores=4 mem_mb=4096\necho hi\n", "j");
        sched.cycle().unwrap();
        assert_eq!(sched.jobs().read(&id).unwrap().unwrap().state, JobState::Running);
    }

    #[test]
    fn cancel_is_idempotent_on_terminal_job() {
        let (dir, sched) = setup();
        let id = submit(&dir, &sched, "#JS cores=1\necho hi\n", "j");
        sched.cancel(&id).unwrap(); // PENDING -> CANCELLED
        sched.cancel(&id).unwrap(); // no-op, already terminal
        let job = sched.jobs().read(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
    }
}
