//! Centralised handling of the on-disk directory layout.
//!
//! All state lives under a single base directory which defaults to
//! `~/.jqs` but can be overridden through the `JQS_HOME` environment
//! variable or the `--dir` flag. [`PathStore`] owns deriving and creating
//! the fixed subtree so the rest of the crate never hand-assembles a path.
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

pub const QUEUE: &str = "queue";
pub const RUNNING: &str = "running";
pub const FINISHED: &str = "finished";
pub const LOCKS: &str = "locks";

/// Resolves and creates on demand the fixed directory tree used by every
/// other component. Creation is idempotent.
#[derive(Debug, Clone)]
pub struct PathStore {
    base: PathBuf,
}

impl PathStore {
    /// Resolve the base directory, honoring `JQS_HOME` if set, falling back
    /// to `~/.jqs`, and ensure the fixed subtree exists.
    pub fn open() -> io::Result<Self> {
        let base = if let Ok(p) = env::var("JQS_HOME") {
            PathBuf::from(p)
        } else {
            home::home_dir()
                .unwrap_or_else(env::temp_dir)
                .join(".jqs")
        };

        Self::at(base)
    }

    /// Same as [`Self::open`] but rooted at an explicit directory, used by
    /// `--dir` and by tests.
    pub fn at(base: PathBuf) -> io::Result<Self> {
        let store = Self { base };
        store.ensure_dirs()?;
        Ok(store)
    }

    fn ensure_dirs(&self) -> io::Result<()> {
        for sub in [QUEUE, RUNNING, FINISHED, LOCKS] {
            fs::create_dir_all(self.base.join(sub))?;
        }
        Ok(())
    }

    pub fn base(&self) -> &PathBuf {
        &self.base
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.base.join(QUEUE)
    }

    pub fn running_dir(&self) -> PathBuf {
        self.base.join(RUNNING)
    }

    pub fn finished_dir(&self) -> PathBuf {
        self.base.join(FINISHED)
    }

    pub fn state_dir(&self, state: crate::job::JobState) -> PathBuf {
        use crate::job::JobState::*;
        match state {
            Pending => self.queue_dir(),
            Running => self.running_dir(),
            Completed | Failed | Cancelled => self.finished_dir(),
        }
    }

    pub fn limits_file(&self) -> PathBuf {
        self.base.join("limits.json")
    }

    pub fn usage_file(&self) -> PathBuf {
        self.base.join("usage.json")
    }

    pub fn usage_lock(&self) -> PathBuf {
        self.base.join(LOCKS).join("usage.lock")
    }

    pub fn counter_file(&self) -> PathBuf {
        self.base.join("jobid_counter")
    }

    pub fn counter_lock(&self) -> PathBuf {
        self.base.join(LOCKS).join("jobid_counter.lock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }
}
