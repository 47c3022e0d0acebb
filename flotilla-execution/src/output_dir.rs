//! Output directory layout of a run

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// File the worker pool writes its run summary to
pub const RUN_SUMMARY_FILE: &str = "run_summary.txt";

/// `<root>/results` and `<root>/logs` under one run directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDirStructure {
    root: PathBuf,
}

impl OutputDirStructure {
    /// Create the run directory. With `make_unique`, an existing `<dir>` is
    /// left alone and the first free `<dir>2`, `<dir>3`, … is used instead.
    pub fn create(dir: impl AsRef<Path>, make_unique: bool) -> io::Result<Self> {
        let dir = dir.as_ref();
        let root = if make_unique { first_free(dir) } else { dir.to_path_buf() };

        std::fs::create_dir_all(&root)?;
        let structure = Self { root };
        std::fs::create_dir_all(structure.results())?;
        std::fs::create_dir_all(structure.logs())?;
        debug!("Using output directory {}", structure.root.display());
        Ok(structure)
    }

    /// Use an existing run directory as is
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { root: dir.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn results(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// `logs/<name>`, created if missing
    pub fn logs_subdir(&self, name: &str) -> io::Result<PathBuf> {
        let path = self.logs().join(name);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn run_summary_path(&self) -> PathBuf {
        self.root.join(RUN_SUMMARY_FILE)
    }
}

fn first_free(dir: &Path) -> PathBuf {
    if !dir.exists() {
        return dir.to_path_buf();
    }
    let base = dir.as_os_str().to_string_lossy().trim_end_matches('/').to_string();
    (2..)
        .map(|n| PathBuf::from(format!("{}{}", base, n)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| dir.to_path_buf())
}
