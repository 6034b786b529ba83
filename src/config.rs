//! Run configuration passed explicitly into every component.
//!
//! Nothing here is global: `main` builds one `Config` from CLI arguments and
//! environment overrides, and each component borrows it at construction.
use anyhow::{anyhow, Result};
use clap::ValueEnum;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ARCHIVE_FORMAT: &str = ".tar";

pub const VALID_ARCHIVE_FORMATS: [&str; 8] = [
    ".tar",
    ".tar.gz",
    ".tar.xz",
    ".tar.bz2",
    ".tar.zst",
    ".tar.lzma",
    ".tar.lzo",
    ".tar.lz",
];

/// Packages every target environment carries regardless of notebook needs.
pub const TARGET_PACKAGES: [&str; 7] = [
    "uv",
    "pip",
    "ipykernel",
    "jupyter",
    "cython",
    "setuptools",
    "wheel",
];

pub const DEFAULT_TEST_JOBS: usize = 4;
pub const DEFAULT_NOTEBOOK_TIMEOUT_SECS: u64 = 30 * 60;

/// How an existing working copy is reconciled with its remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RepoMode {
    /// Fetch and advance to the requested ref or the upstream tip.
    Floating,
    /// Check out exactly the requested or recorded commit; never advance.
    Locked,
}

impl RepoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoMode::Floating => "floating",
            RepoMode::Locked => "locked",
        }
    }
}

impl fmt::Display for RepoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with uncommitted changes found during a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DirtyPolicy {
    /// Report the repository as failed and leave it untouched.
    Fail,
    /// `git stash` the changes, then reconcile.
    Stash,
    /// Hard reset and clean, then reconcile.
    Discard,
}

impl DirtyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirtyPolicy::Fail => "fail",
            DirtyPolicy::Stash => "stash",
            DirtyPolicy::Discard => "discard",
        }
    }
}

impl fmt::Display for DirtyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command lines for the external collaborators.
///
/// Each value may carry leading arguments (`"uv pip"`); they are split with
/// shell quoting rules at invocation time.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCommands {
    pub git: String,
    pub mamba: String,
    pub pip: String,
    pub resolver: String,
    pub python: String,
    pub jupyter: String,
    pub notebook_runner: String,
    pub tar: String,
    pub aws: String,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            mamba: "micromamba".to_string(),
            pip: "uv pip".to_string(),
            resolver: "uv pip compile".to_string(),
            python: "python".to_string(),
            jupyter: "jupyter".to_string(),
            notebook_runner: "papermill".to_string(),
            tar: "tar".to_string(),
            aws: "aws".to_string(),
        }
    }
}

/// Per-operation time budgets.
#[derive(Debug, Clone, Serialize)]
pub struct Timeouts {
    pub default: Duration,
    pub git: Duration,
    pub env_create: Duration,
    pub install: Duration,
    pub compile: Duration,
    pub import_test: Duration,
    pub notebook: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(300),
            git: Duration::from_secs(300),
            env_create: Duration::from_secs(600),
            install: Duration::from_secs(1200),
            compile: Duration::from_secs(600),
            import_test: Duration::from_secs(60),
            notebook: Duration::from_secs(DEFAULT_NOTEBOOK_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Live installation root (environment manager prefix, caches, temps).
    pub root: PathBuf,
    pub env_root: PathBuf,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub repos_dir: PathBuf,
    pub pantry_dir: PathBuf,
    pub tools: ToolCommands,
    pub timeouts: Timeouts,
    pub jobs: usize,
    pub repo_mode: RepoMode,
    pub dirty_policy: DirtyPolicy,
    pub shallow: bool,
    pub archive_format: Option<String>,
    /// Additional pip requirement files merged as injected constraints.
    pub injected_requirements: Vec<PathBuf>,
    pub ignore_spec_hash: bool,
    pub add_pip_hashes: bool,
    pub force: bool,
}

impl Config {
    /// Defaults laid out under `root`, with no environment overrides applied.
    pub fn with_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            env_root: root.join("mm"),
            cache_dir: root.join("cache"),
            output_dir: root.join("temps"),
            repos_dir: root.join("references"),
            pantry_dir: root.join("pantry"),
            tools: ToolCommands::default(),
            timeouts: Timeouts::default(),
            jobs: DEFAULT_TEST_JOBS,
            repo_mode: RepoMode::Floating,
            dirty_policy: DirtyPolicy::Fail,
            shallow: false,
            archive_format: None,
            injected_requirements: Vec::new(),
            ignore_spec_hash: false,
            add_pip_hashes: false,
            force: false,
        }
    }

    /// Root taken from `NBENV_ROOT`, falling back to `~/.nbenv-live`.
    pub fn default_root() -> Result<PathBuf> {
        if let Some(root) = std::env::var_os("NBENV_ROOT") {
            return Ok(PathBuf::from(root));
        }
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(home.join(".nbenv-live"))
    }

    /// Apply `NBENV_*` overrides for tool commands and pantry location.
    pub fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut String); 3] = [
            ("NBENV_MAMBA_CMD", &mut self.tools.mamba),
            ("NBENV_PIP_CMD", &mut self.tools.pip),
            ("NBENV_RESOLVER_CMD", &mut self.tools.resolver),
        ];
        for (name, slot) in overrides {
            if let Ok(value) = std::env::var(name) {
                if !value.trim().is_empty() {
                    *slot = value;
                }
            }
        }
        if let Some(pantry) = std::env::var_os("NBENV_PANTRY") {
            self.pantry_dir = PathBuf::from(pantry);
        }
        if let Some(cache) = std::env::var_os("NBENV_CACHE") {
            self.cache_dir = PathBuf::from(cache);
        }
    }

    /// Prefix directory of a named environment.
    pub fn env_prefix(&self, env_name: &str) -> PathBuf {
        self.env_root.join("envs").join(env_name)
    }

    /// Environment variables exported to every tool invocation so caches and
    /// environments stay under the live root.
    pub fn tool_env(&self) -> Vec<(String, String)> {
        vec![
            (
                "MAMBA_ROOT_PREFIX".to_string(),
                self.env_root.display().to_string(),
            ),
            (
                "UV_CACHE_DIR".to_string(),
                self.cache_dir.join("uv").display().to_string(),
            ),
            (
                "PIP_CACHE_DIR".to_string(),
                self.cache_dir.join("pip").display().to_string(),
            ),
        ]
    }

    /// Program names from [`ToolCommands`] that cannot be found on `PATH`.
    pub fn missing_tools(&self) -> Vec<String> {
        let tools = &self.tools;
        [
            &tools.git,
            &tools.mamba,
            &tools.pip,
            &tools.resolver,
            &tools.python,
            &tools.jupyter,
            &tools.notebook_runner,
            &tools.tar,
            &tools.aws,
        ]
        .into_iter()
        .filter_map(|command| shell_words::split(command).ok()?.into_iter().next())
        .filter(|program| which::which(program).is_err())
        .collect()
    }

    /// Reject settings that would make later stages misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            return Err(anyhow!("jobs must be at least 1"));
        }
        if self.timeouts.notebook.is_zero() {
            return Err(anyhow!("notebook timeout must be positive"));
        }
        if let Some(format) = &self.archive_format {
            if !format.starts_with(".tar") {
                return Err(anyhow!("archive format {format:?} is not a tar format"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
