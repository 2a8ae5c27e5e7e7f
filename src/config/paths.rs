use anyhow::Result;
use std::path::PathBuf;

use crate::utils::{ensure_dir, get_patchbay_home, safe_filename};

/// Resolved state-directory layout, threaded through every component so
/// nothing reaches for ambient process state.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// Resolve from `$PATCHBAY_HOME` or `~/.patchbay`.
    pub fn resolve() -> Result<Self> {
        Ok(Self {
            root: get_patchbay_home()?,
        })
    }

    /// Use an explicit root (tests, embedded use).
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn health_dir(&self) -> PathBuf {
        self.root.join("health")
    }

    pub fn schedules_dir(&self) -> PathBuf {
        self.root.join("schedules")
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.root.join("executions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn all_tools_json(&self) -> PathBuf {
        self.cache_dir().join("all-tools.json")
    }

    pub fn all_tools_csv(&self) -> PathBuf {
        self.cache_dir().join("all-tools.csv")
    }

    pub fn embeddings_json(&self) -> PathBuf {
        self.cache_dir().join("embeddings.json")
    }

    pub fn embeddings_metadata_json(&self) -> PathBuf {
        self.cache_dir().join("embeddings-metadata.json")
    }

    pub fn health_file(&self, server: &str) -> PathBuf {
        self.health_dir().join(format!("{}.json", safe_filename(server)))
    }

    pub fn stderr_log(&self, server: &str) -> PathBuf {
        self.logs_dir()
            .join(format!("{}.stderr.log", safe_filename(server)))
    }

    pub fn job_file(&self, job_id: &str) -> PathBuf {
        self.schedules_dir()
            .join(format!("{}.json", safe_filename(job_id)))
    }

    pub fn execution_file(&self, execution_id: &str) -> PathBuf {
        self.executions_dir()
            .join(format!("{}.json", safe_filename(execution_id)))
    }

    /// Create every state directory up front.
    pub fn ensure_layout(&self) -> Result<()> {
        ensure_dir(self.profiles_dir())?;
        ensure_dir(self.cache_dir())?;
        ensure_dir(self.health_dir())?;
        ensure_dir(self.schedules_dir())?;
        ensure_dir(self.executions_dir())?;
        ensure_dir(self.logs_dir())?;
        Ok(())
    }
}
