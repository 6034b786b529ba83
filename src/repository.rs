//! Local working copies of the notebook repositories.
//!
//! Each URL maps to `<repos_dir>/<basename>`. A missing working copy is
//! cloned; an existing one is reconciled according to the configured
//! [`RepoMode`] and [`DirtyPolicy`]. One repository failing never discards the
//! results of its siblings.
use crate::config::{Config, DirtyPolicy, RepoMode};
use crate::diagnostics::Diagnostics;
use crate::process::{self, CommandOutcome, CommandSpec};
use crate::util::repo_basename;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// A resolved working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoState {
    pub commit: String,
    pub path: PathBuf,
}

/// Outcome of one `resolve_all` pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ResolveReport {
    pub resolved: BTreeMap<String, RepoState>,
    pub failures: BTreeMap<String, String>,
}

impl ResolveReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// URL to resolved commit.
    pub fn commits(&self) -> BTreeMap<String, String> {
        self.resolved
            .iter()
            .map(|(url, state)| (url.clone(), state.commit.clone()))
            .collect()
    }
}

pub struct RepositorySet<'a> {
    config: &'a Config,
}

impl<'a> RepositorySet<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn repo_path(&self, url: &str) -> PathBuf {
        self.config.repos_dir.join(repo_basename(url))
    }

    /// Clone or reconcile every URL. `refs` carries the branch, tag or commit
    /// wanted per URL; URLs without one follow the remote default branch.
    pub fn resolve_all(&self, urls: &[String], refs: &BTreeMap<String, String>) -> ResolveReport {
        let start = Instant::now();
        let mut report = ResolveReport::default();
        if let Err(err) = fs::create_dir_all(&self.config.repos_dir) {
            for url in urls {
                report.failures.insert(
                    url.clone(),
                    format!("create {}: {err}", self.config.repos_dir.display()),
                );
            }
            return report;
        }
        for url in urls {
            let git_ref = refs.get(url).map(String::as_str);
            match self.resolve_one(url, git_ref) {
                Ok(state) => {
                    tracing::info!(url = %url, commit = %state.commit, "repository resolved");
                    report.resolved.insert(url.clone(), state);
                }
                Err(err) => {
                    tracing::error!(url = %url, "repository failed: {err:#}");
                    report.failures.insert(url.clone(), format!("{err:#}"));
                }
            }
        }
        tracing::info!(
            resolved = report.resolved.len(),
            failed = report.failures.len(),
            elapsed_ms = start.elapsed().as_millis(),
            mode = self.config.repo_mode.as_str(),
            "repository pass finished"
        );
        report
    }

    fn resolve_one(&self, url: &str, git_ref: Option<&str>) -> Result<RepoState> {
        let path = self.repo_path(url);
        if path.exists() {
            if !path.join(".git").exists() {
                return Err(anyhow!("{} exists but is not a git working copy", path.display()));
            }
            tracing::info!(path = %path.display(), "using existing local clone");
            self.prepare_worktree(&path)?;
            match self.config.repo_mode {
                RepoMode::Floating => self.reconcile_floating(&path, git_ref)?,
                RepoMode::Locked => self.reconcile_locked(&path, git_ref)?,
            }
        } else {
            self.clone_repo(url, &path, git_ref)?;
        }
        Ok(RepoState {
            commit: self.head_commit(&path)?,
            path,
        })
    }

    fn clone_repo(&self, url: &str, path: &Path, git_ref: Option<&str>) -> Result<()> {
        let mut args = vec!["clone".to_string()];
        if git_ref.is_none() {
            args.push("--single-branch".to_string());
            if self.config.shallow {
                args.extend(["--depth".to_string(), "1".to_string()]);
            }
        }
        args.push(url.to_string());
        args.push(path.display().to_string());
        tracing::info!(url, path = %path.display(), "cloning repository");
        self.git_checked(None, &args)?;
        if let Some(git_ref) = git_ref {
            self.git_checked(Some(path), &["checkout", git_ref])?;
        }
        Ok(())
    }

    fn prepare_worktree(&self, path: &Path) -> Result<()> {
        if self.is_clean(path)? {
            return Ok(());
        }
        match self.config.dirty_policy {
            DirtyPolicy::Fail => Err(anyhow!(
                "working copy {} has uncommitted changes (dirty policy: fail)",
                path.display()
            )),
            DirtyPolicy::Stash => {
                tracing::warn!(path = %path.display(), "stashing uncommitted changes");
                self.git_checked(
                    Some(path),
                    &["stash", "push", "--include-untracked", "-m", "nbenv: stashed before reconcile"],
                )?;
                Ok(())
            }
            DirtyPolicy::Discard => {
                tracing::warn!(path = %path.display(), "discarding uncommitted changes");
                self.git_checked(Some(path), &["reset", "--hard"])?;
                self.git_checked(Some(path), &["clean", "-fd"])?;
                Ok(())
            }
        }
    }

    fn reconcile_floating(&self, path: &Path, git_ref: Option<&str>) -> Result<()> {
        self.git_checked(Some(path), &["fetch", "origin"])?;
        match git_ref {
            None => {
                let branch = self.default_branch(path)?;
                tracing::debug!(path = %path.display(), branch = %branch, "following remote default branch");
                self.git_checked(Some(path), &["checkout", &branch])?;
                self.git_checked(Some(path), &["merge", "--ff-only", &format!("origin/{branch}")])?;
            }
            Some(git_ref) => {
                self.git_checked(Some(path), &["checkout", git_ref])?;
                let upstream = format!("origin/{git_ref}");
                let tracks_branch = self
                    .git(Some(path), &["rev-parse", "--verify", "--quiet", &upstream])?
                    .success();
                if tracks_branch {
                    self.git_checked(Some(path), &["merge", "--ff-only", &upstream])?;
                }
            }
        }
        Ok(())
    }

    /// Branch that `origin/HEAD` points at, e.g. `main`.
    fn default_branch(&self, path: &Path) -> Result<String> {
        let query = ["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"];
        let mut outcome = self.git(Some(path), &query)?;
        if !outcome.success() {
            self.git_checked(Some(path), &["remote", "set-head", "origin", "--auto"])?;
            outcome = self.git(Some(path), &query)?;
        }
        let head = outcome.stdout.trim();
        head.strip_prefix("origin/")
            .filter(|branch| outcome.success() && !branch.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("cannot determine the default branch of origin in {}", path.display()))
    }

    fn reconcile_locked(&self, path: &Path, git_ref: Option<&str>) -> Result<()> {
        let Some(git_ref) = git_ref else {
            tracing::debug!(path = %path.display(), "locked without a ref, keeping HEAD");
            return Ok(());
        };
        let object = format!("{git_ref}^{{commit}}");
        let present = self
            .git(Some(path), &["rev-parse", "--verify", "--quiet", &object])?
            .success();
        if !present {
            tracing::info!(path = %path.display(), git_ref, "ref not present locally, fetching");
            self.git_checked(Some(path), &["fetch", "origin", "--tags"])?;
        }
        self.git_checked(Some(path), &["checkout", "--detach", git_ref])?;
        Ok(())
    }

    /// True when `git status --porcelain` reports nothing.
    pub fn is_clean(&self, path: &Path) -> Result<bool> {
        let status = self.git_checked(Some(path), &["status", "--porcelain"])?;
        let clean = status.trim().is_empty();
        tracing::debug!(path = %path.display(), clean, "repository status");
        Ok(clean)
    }

    pub fn head_commit(&self, path: &Path) -> Result<String> {
        Ok(self
            .git_checked(Some(path), &["rev-parse", "HEAD"])?
            .trim()
            .to_string())
    }

    /// Remove the working copies of `urls`, then the repos directory itself
    /// once nothing else is left in it.
    pub fn delete_all(&self, urls: &[String], diag: &mut Diagnostics) -> bool {
        match self.delete_all_inner(urls) {
            Ok(()) => true,
            Err(err) => diag.exception("Error during repository deletion", &err),
        }
    }

    fn delete_all_inner(&self, urls: &[String]) -> Result<()> {
        for url in urls {
            let path = self.repo_path(url);
            if path.exists() {
                tracing::debug!(path = %path.display(), "removing repo directory");
                fs::remove_dir_all(&path).with_context(|| format!("remove {}", path.display()))?;
            } else {
                tracing::debug!(path = %path.display(), "skipping delete for nonexistent repo");
            }
        }
        let repos_dir = &self.config.repos_dir;
        if !repos_dir.exists() {
            return Ok(());
        }
        let remaining = fs::read_dir(repos_dir)
            .with_context(|| format!("read {}", repos_dir.display()))?
            .count();
        if remaining == 0 {
            tracing::debug!(path = %repos_dir.display(), "removing empty repos directory");
            fs::remove_dir(repos_dir).with_context(|| format!("remove {}", repos_dir.display()))?;
        } else {
            tracing::debug!(path = %repos_dir.display(), remaining, "repos directory not empty");
        }
        Ok(())
    }

    fn git<S: AsRef<str>>(&self, cwd: Option<&Path>, args: &[S]) -> Result<CommandOutcome> {
        let mut spec = CommandSpec::tool(&self.config.tools.git, args, self.config.timeouts.git)?
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(cwd) = cwd {
            spec = spec.current_dir(cwd);
        }
        process::run(&spec)
    }

    /// Run git and return stdout, turning any unsuccessful outcome into an
    /// error that carries git's own message.
    fn git_checked<S: AsRef<str>>(&self, cwd: Option<&Path>, args: &[S]) -> Result<String> {
        let outcome = self.git(cwd, args)?;
        if !outcome.success() {
            let command = args.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" ");
            return Err(anyhow!(
                "git {command} failed ({}): {}",
                outcome.failure_reason(),
                outcome.stderr.trim()
            ));
        }
        Ok(outcome.stdout)
    }
}

#[cfg(test)]
#[path = "repository_tests.rs"]
mod tests;
