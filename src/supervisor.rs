//! Supervisor capability: abstracts over the external process
//! supervisor so the scheduler never races it for process state.
//!
//! The production adapter shells out to `systemd-run`/`systemctl` to launch,
//! stop, and poll a unit. The fake adapter is an in-memory process table used
//! by tests so scheduler logic can be exercised without a real systemd user
//! session.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use crate::job::expand_template;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Active,
    Inactive,
    Failed,
    Activating,
    Deactivating,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Running,
    Exited,
    Dead,
    Failed,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct UnitStatus {
    pub active_state: ActiveState,
    pub sub_state: SubState,
    pub exit_status: Option<i32>,
}

impl UnitStatus {
    /// A unit is terminal iff `active_state == inactive` and
    /// `sub_state ∈ {exited, dead}`.
    pub fn is_terminal(&self) -> bool {
        self.active_state == ActiveState::Inactive
            && matches!(self.sub_state, SubState::Exited | SubState::Dead)
    }

    /// Exit code, defaulting to 0 when absent.
    pub fn exit_code(&self) -> i32 {
        self.exit_status.unwrap_or(0)
    }
}

pub struct LaunchParams<'a> {
    pub unit: &'a str,
    pub cores: i64,
    pub mem_mb: i64,
    pub workdir: &'a Path,
    pub stdout_path: &'a Path,
    pub stderr_path: &'a Path,
    pub time_limit: Option<&'a str>,
    pub script_path: &'a Path,
}

#[derive(Debug, Clone, Copy)]
pub enum LaunchOutcome {
    Launched,
    Failed(i32),
}

/// Abstract capability over an external process supervisor.
pub trait Supervisor {
    fn launch(&self, params: LaunchParams<'_>) -> LaunchOutcome;
    fn stop(&self, unit: &str) -> bool;
    /// `None` signals a status-query failure (unit disappeared).
    fn status(&self, unit: &str) -> Option<UnitStatus>;
}

/// Resolve the stdout/stderr paths for a job: template-expand, then make
/// relative to `workdir`.
pub fn resolve_io_path(template: &str, name: &str, job_id: &str, workdir: &Path) -> PathBuf {
    let expanded = expand_template(template, name, job_id);
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        p
    } else {
        workdir.join(p)
    }
}

/// Production adapter wrapping `systemd-run --user` / `systemctl`.
pub struct SystemdSupervisor;

impl Supervisor for SystemdSupervisor {
    fn launch(&self, params: LaunchParams<'_>) -> LaunchOutcome {
        let cpu_quota = format!("{}%", params.cores * 100);
        let mem_max = format!("{}M", params.mem_mb);

        let mut cmd = Command::new("systemd-run");
        cmd.arg("--user")
            .arg("--unit")
            .arg(params.unit)
            .arg("--collect")
            .arg(format!("--property=CPUQuota={cpu_quota}"))
            .arg(format!("--property=MemoryMax={mem_max}"))
            .arg(format!(
                "--property=WorkingDirectory={}",
                params.workdir.display()
            ))
            .arg(format!(
                "--property=StandardOutput=append:{}",
                params.stdout_path.display()
            ))
            .arg(format!(
                "--property=StandardError=append:{}",
                params.stderr_path.display()
            ))
            .arg("--property=KillMode=mixed")
            .arg("--property=TimeoutStopSec=15s");

        if let Some(limit) = params.time_limit {
            cmd.arg(format!("--property=RuntimeMax={limit}"));
        }

        cmd.arg("/bin/bash").arg(params.script_path);

        match cmd.status() {
            Ok(status) if status.success() => LaunchOutcome::Launched,
            Ok(status) => LaunchOutcome::Failed(status.code().unwrap_or(1)),
            Err(_) => LaunchOutcome::Failed(1),
        }
    }

    fn stop(&self, unit: &str) -> bool {
        Command::new("systemctl")
            .arg("--user")
            .arg("stop")
            .arg(unit)
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn status(&self, unit: &str) -> Option<UnitStatus> {
        let output = Command::new("systemctl")
            .arg("--user")
            .arg("show")
            .arg("--property=ActiveState,ExecMainStatus,SubState")
            .arg(unit)
            .output()
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut active_state = ActiveState::Unknown;
        let mut sub_state = SubState::Other;
        let mut exit_status = None;

        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                match key {
                    "ActiveState" => {
                        active_state = match value {
                            "active" => ActiveState::Active,
                            "inactive" => ActiveState::Inactive,
                            "failed" => ActiveState::Failed,
                            "activating" => ActiveState::Activating,
                            "deactivating" => ActiveState::Deactivating,
                            _ => ActiveState::Unknown,
                        };
                    }
                    "SubState" => {
                        sub_state = match value {
                            "running" => SubState::Running,
                            "exited" => SubState::Exited,
                            "dead" => SubState::Dead,
                            "failed" => SubState::Failed,
                            _ => SubState::Other,
                        };
                    }
                    "ExecMainStatus" => {
                        exit_status = value.parse::<i32>().ok();
                    }
                    _ => {}
                }
            }
        }

        Some(UnitStatus {
            active_state,
            sub_state,
            exit_status,
        })
    }
}

/// In-memory process table used by tests. Launch calls are recorded and the
/// terminal state of each unit is whatever the test scripted via
/// [`FakeSupervisor::set_status`] / [`FakeSupervisor::fail_next_launch`].
#[derive(Default)]
pub struct FakeSupervisor {
    statuses: Mutex<HashMap<String, UnitStatus>>,
    fail_launch: Mutex<Option<i32>>,
    stopped: Mutex<Vec<String>>,
    launched: Mutex<Vec<String>>,
    missing: Mutex<std::collections::HashSet<String>>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, unit: &str, status: UnitStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(unit.to_string(), status);
    }

    pub fn fail_next_launch(&self, code: i32) {
        *self.fail_launch.lock().unwrap() = Some(code);
    }

    /// Simulate the unit disappearing: `status` will report a query failure.
    pub fn make_unit_disappear(&self, unit: &str) {
        self.missing.lock().unwrap().insert(unit.to_string());
    }

    pub fn launched_units(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    pub fn stopped_units(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

impl Supervisor for FakeSupervisor {
    fn launch(&self, params: LaunchParams<'_>) -> LaunchOutcome {
        if let Some(code) = self.fail_launch.lock().unwrap().take() {
            return LaunchOutcome::Failed(code);
        }
        self.launched.lock().unwrap().push(params.unit.to_string());
        self.statuses.lock().unwrap().insert(
            params.unit.to_string(),
            UnitStatus {
                active_state: ActiveState::Active,
                sub_state: SubState::Running,
                exit_status: None,
            },
        );
        LaunchOutcome::Launched
    }

    fn stop(&self, unit: &str) -> bool {
        self.stopped.lock().unwrap().push(unit.to_string());
        true
    }

    fn status(&self, unit: &str) -> Option<UnitStatus> {
        if self.missing.lock().unwrap().contains(unit) {
            return None;
        }
        self.statuses.lock().unwrap().get(unit).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_requires_inactive_and_exited_or_dead() {
        let running = UnitStatus {
            active_state: ActiveState::Active,
            sub_state: SubState::Running,
            exit_status: None,
        };
        assert!(!running.is_terminal());

        let exited = UnitStatus {
            active_state: ActiveState::Inactive,
            sub_state: SubState::Exited,
            exit_status: Some(0),
        };
        assert!(exited.is_terminal());
    }

    #[test]
    fn missing_exit_status_defaults_to_zero() {
        let status = UnitStatus {
            active_state: ActiveState::Inactive,
            sub_state: SubState::Dead,
            exit_status: None,
        };
        assert_eq!(status.exit_code(), 0);
    }

    #[test]
    fn resolves_relative_io_paths_against_workdir() {
        let p = resolve_io_path("%x.out", "build", "20260101-0001", Path::new("/work"));
        assert_eq!(p, PathBuf::from("/work/build.out"));
    }

    #[test]
    fn absolute_io_template_is_left_untouched() {
        let p = resolve_io_path("/var/log/%j.out", "build", "20260101-0001", Path::new("/work"));
        assert_eq!(p, PathBuf::from("/var/log/20260101-0001.out"));
    }
}
