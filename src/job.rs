//! Job records and the [`JobStore`] CRUD layer.
//!
//! A job is a directory named by its job id, containing `meta.json` and
//! `script.sh`. The directory's parent (`queue/`, `running/`, `finished/`)
//! is the authoritative encoding of state; `meta.json`'s `state` field
//! mirrors it. This module also owns the monotonic job-id counter and the
//! `#JS` script-header parser (an external collaborator, but
//! implemented here since this crate delivers the whole system).
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::{JqsError, Result};
use crate::lock::LockedFile;
use crate::paths::PathStore;

pub const META_FILE: &str = "meta.json";
pub const SCRIPT_FILE: &str = "script.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirements {
    pub cores: i64,
    pub mem_mb: i64,
    pub time_limit: Option<String>,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            cores: 1,
            mem_mb: 1024,
            time_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIo {
    pub stdout: String,
    pub stderr: String,
}

impl Default for JobIo {
    fn default() -> Self {
        Self {
            stdout: "stdout.log".to_string(),
            stderr: "stderr.log".to_string(),
        }
    }
}

/// The `meta.json` document persisted alongside each job's script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub name: String,
    pub user: String,
    pub submit_time: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub req: Requirements,
    pub io: JobIo,
    pub workdir: String,
    pub state: JobState,
    pub unit_name: Option<String>,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The fields parsed out of a script's `#JS` header.
#[derive(Debug, Clone)]
pub struct ParsedHeader {
    pub name: Option<String>,
    pub req: Requirements,
    pub io: JobIo,
    pub workdir: Option<PathBuf>,
}

/// Parse `#JS key=value ...` directive lines from the start of a script.
/// Parsing stops at the first non-comment, non-empty line. Unknown keys are
/// ignored silently; quoted values strip exactly one layer of quotes.
/// `cores`/`mem_mb` must parse as a positive integer or the whole script is
/// rejected with [`JqsError::InvalidDirective`].
pub fn parse_script_header(contents: &str, script_path: &Path) -> Result<ParsedHeader> {
    let mut header = ParsedHeader {
        name: None,
        req: Requirements::default(),
        io: JobIo::default(),
        workdir: None,
    };

    for line in contents.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("#JS") {
            for (key, value) in directive_pairs(rest) {
                apply_directive(&mut header, &key, &value, script_path)?;
            }
            continue;
        }
        if trimmed.starts_with('#') || trimmed.is_empty() {
            continue;
        }
        break;
    }

    Ok(header)
}

fn apply_directive(
    header: &mut ParsedHeader,
    key: &str,
    value: &str,
    script_path: &Path,
) -> Result<()> {
    match key {
        "cores" => header.req.cores = parse_positive_directive(key, value, script_path)?,
        "mem_mb" => header.req.mem_mb = parse_positive_directive(key, value, script_path)?,
        "time_limit" => header.req.time_limit = Some(value.to_string()),
        "stdout" => header.io.stdout = value.to_string(),
        "stderr" => header.io.stderr = value.to_string(),
        "name" => header.name = Some(value.to_string()),
        "workdir" => header.workdir = Some(PathBuf::from(value)),
        _ => {}
    }
    Ok(())
}

fn parse_positive_directive(key: &str, value: &str, script_path: &Path) -> Result<i64> {
    let parsed: i64 = value.parse().map_err(|_| {
        JqsError::InvalidDirective(
            script_path.to_path_buf(),
            format!("'{key}={value}' is not an integer"),
        )
    })?;
    if parsed <= 0 {
        return Err(JqsError::InvalidDirective(
            script_path.to_path_buf(),
            format!("'{key}' must be positive, got {parsed}"),
        ));
    }
    Ok(parsed)
}

/// Tokenize `key=value key="quoted value"` pairs from a directive line,
/// stripping exactly one layer of surrounding single or double quotes.
fn directive_pairs(line: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        let key_start = i;
        while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() || chars[i] != '=' {
            break;
        }
        let key: String = chars[key_start..i].iter().collect();
        i += 1; // skip '='

        let value = if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') {
            let quote = chars[i];
            i += 1;
            let val_start = i;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            let val: String = chars[val_start..i].iter().collect();
            if i < chars.len() {
                i += 1; // skip closing quote
            }
            val
        } else {
            let val_start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            chars[val_start..i].iter().collect()
        };

        if !key.is_empty() {
            pairs.push((key, value));
        }
    }

    pairs
}

/// Expand `%x` (job name) and `%j` (job id) in a path template; other
/// `%`-sequences are left literal.
pub fn expand_template(template: &str, name: &str, job_id: &str) -> String {
    template.replace("%x", name).replace("%j", job_id)
}

pub fn now_iso() -> String {
    Local::now().to_rfc3339()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| JqsError::io(path, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| JqsError::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| JqsError::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
    fs::write(path, json).map_err(|e| JqsError::io(path, e))
}

/// CRUD over per-job directories.
pub struct JobStore {
    paths: PathStore,
}

impl JobStore {
    pub fn new(paths: PathStore) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &PathStore {
        &self.paths
    }

    /// Atomically increment the counter under its own lock and format it as
    /// `YYYYMMDD-NNNN`, widening the numeric field if the counter exceeds
    /// four digits.
    pub fn allocate_id(&self) -> Result<String> {
        let lock_path = self.paths.counter_lock();
        let counter_path = self.paths.counter_file();

        let next = LockedFile::with_lock(&lock_path, |_f| -> io::Result<u64> {
            let current = fs::read_to_string(&counter_path)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(0);
            let next = current + 1;
            fs::write(&counter_path, next.to_string())?;
            Ok(next)
        })
        .map_err(|e| JqsError::io(&counter_path, e))?;

        let today = Local::now().format("%Y%m%d");
        Ok(format!("{today}-{next:04}"))
    }

    /// Create a new PENDING job from a submitted script.
    pub fn create(
        &self,
        script_path: &Path,
        header: ParsedHeader,
        user: String,
    ) -> Result<String> {
        let job_id = self.allocate_id()?;

        let name = header.name.unwrap_or_else(|| {
            script_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| job_id.clone())
        });

        let workdir = header
            .workdir
            .or_else(|| script_path.parent().map(PathBuf::from))
            .map(|p| fs::canonicalize(&p).unwrap_or(p))
            .unwrap_or_else(|| PathBuf::from("."));

        let job_dir = self.paths.queue_dir().join(&job_id);
        fs::create_dir_all(&job_dir).map_err(|e| JqsError::io(&job_dir, e))?;

        let dest_script = job_dir.join(SCRIPT_FILE);
        fs::copy(script_path, &dest_script).map_err(|e| JqsError::io(&dest_script, e))?;

        let job = Job {
            job_id: job_id.clone(),
            name,
            user,
            submit_time: now_iso(),
            start_time: None,
            end_time: None,
            req: header.req,
            io: header.io,
            workdir: workdir.to_string_lossy().into_owned(),
            state: JobState::Pending,
            unit_name: None,
            exit_code: None,
            notes: None,
        };

        write_json(&job_dir.join(META_FILE), &job)?;

        Ok(job_id)
    }

    /// Search `queue/`, `running/`, `finished/` in that order and return the
    /// first matching job, if any.
    pub fn read(&self, job_id: &str) -> Result<Option<Job>> {
        for dir in [
            self.paths.queue_dir(),
            self.paths.running_dir(),
            self.paths.finished_dir(),
        ] {
            let meta_path = dir.join(job_id).join(META_FILE);
            if meta_path.exists() {
                return Ok(Some(read_json(&meta_path)?));
            }
        }
        Ok(None)
    }

    fn locate_dir(&self, job_id: &str) -> Option<PathBuf> {
        for dir in [
            self.paths.queue_dir(),
            self.paths.running_dir(),
            self.paths.finished_dir(),
        ] {
            let candidate = dir.join(job_id);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    /// Mutate state and timestamps according to the transition rules,
    /// merge caller-supplied extra fields, and persist. Does **not** move
    /// the directory; callers must call [`Self::move_to`] afterwards, in
    /// that order, so a crash between the two leaves metadata correct with
    /// only the directory location lagging.
    pub fn update(
        &self,
        job_id: &str,
        new_state: JobState,
        apply_extra: impl FnOnce(&mut Job),
    ) -> Result<Job> {
        let job_dir = self
            .locate_dir(job_id)
            .ok_or_else(|| JqsError::NotFound(job_id.to_string()))?;
        let meta_path = job_dir.join(META_FILE);

        let mut job: Job = read_json(&meta_path)?;
        let old_state = job.state;
        job.state = new_state;

        if new_state == JobState::Running && old_state == JobState::Pending {
            job.start_time = Some(now_iso());
            if job.unit_name.is_none() {
                job.unit_name = Some(format!("jqs-job-{job_id}"));
            }
        }

        if new_state.is_terminal() && !old_state.is_terminal() {
            job.end_time = Some(now_iso());
        }

        apply_extra(&mut job);

        write_json(&meta_path, &job)?;
        Ok(job)
    }

    /// Rename the job directory into `target_dir`. Falls back to
    /// copy-then-remove on cross-device filesystems, leaving the destination
    /// complete before the source is removed. A target that already exists
    /// (e.g. a concurrent cancel and reconcile racing the same job) is
    /// treated as success.
    pub fn move_to(&self, job_id: &str, target_dir: &Path) -> Result<()> {
        let target = target_dir.join(job_id);
        if target.exists() {
            return Ok(());
        }

        let current = match self.locate_dir(job_id) {
            Some(dir) => dir,
            None => return Ok(()), // already moved by a concurrent actor
        };

        if current == target {
            return Ok(());
        }

        match fs::rename(&current, &target) {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::CrossesDevices | io::ErrorKind::ExecutableFileBusy
                ) =>
            {
                copy_dir_recursive(&current, &target).map_err(|e| JqsError::io(&target, e))?;
                fs::remove_dir_all(&current).map_err(|e| JqsError::io(&current, e))?;
                Ok(())
            }
            Err(e) => Err(JqsError::io(&current, e)),
        }
    }

    /// Enumerate and parse metadata for each subdirectory of `state_dir`,
    /// skipping entries without a readable metadata file.
    pub fn list(&self, state_dir: &Path) -> Vec<Job> {
        let mut jobs = Vec::new();
        let Ok(entries) = fs::read_dir(state_dir) else {
            return jobs;
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let meta_path = entry.path().join(META_FILE);
            if let Ok(job) = read_json::<Job>(&meta_path) {
                jobs.push(job);
            }
        }
        jobs
    }

    pub fn list_pending(&self) -> Vec<Job> {
        self.list(&self.paths.queue_dir())
    }

    pub fn list_running(&self) -> Vec<Job> {
        self.list(&self.paths.running_dir())
    }

    pub fn list_finished(&self) -> Vec<Job> {
        self.list(&self.paths.finished_dir())
    }

    /// Union of pending, running, and the full (untruncated) finished set.
    pub fn list_all(&self) -> Vec<Job> {
        let mut jobs = self.list_pending();
        jobs.extend(self.list_running());
        jobs.extend(self.list_finished());
        jobs
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}
