//! Import checks and notebook execution inside the target environment.
//!
//! Import checks run one at a time and never stop early. Notebooks run on a
//! pool of `jobs` worker threads; each worker copies the notebook's directory
//! into a private temporary directory, runs it under the notebook timeout, and
//! hands back the captured output. Results come back in input order.
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::discovery::CHECKPOINT_PATTERN;
use crate::environment::EnvironmentLifecycle;
use crate::interrupt;
use crate::process::{self, CommandSpec};
use crate::util::divider;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Name of the private copy of a notebook's directory.
const TEST_DIR: &str = "notebook-test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::TimedOut => "timed_out",
            TestStatus::Skipped => "skipped",
        }
    }
}

/// Outcome of running one notebook.
#[derive(Debug, Clone, Serialize)]
pub struct NotebookResult {
    pub notebook: String,
    pub status: TestStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u128,
    pub output: String,
}

impl NotebookResult {
    pub fn failed(&self) -> bool {
        matches!(self.status, TestStatus::Failed | TestStatus::TimedOut)
    }
}

/// Per-package import outcome.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub passed: Vec<String>,
    pub failed: BTreeMap<String, String>,
}

impl ImportReport {
    pub fn all_passed(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ValidationRunner<'a> {
    config: &'a Config,
}

impl<'a> ValidationRunner<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Notebooks matching any of the comma-separated `patterns`, sorted and
    /// deduplicated. Checkpoint copies never survive.
    pub fn filter_notebooks(&self, notebooks: &[String], patterns: &str) -> Result<Vec<String>> {
        let regexes = patterns
            .split(',')
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("invalid notebook pattern {pattern:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let checkpoint = Regex::new(CHECKPOINT_PATTERN).expect("regex for checkpoint files");
        let filtered: BTreeSet<String> = notebooks
            .iter()
            .filter(|notebook| !checkpoint.is_match(notebook))
            .filter(|notebook| regexes.iter().any(|re| re.is_match(notebook)))
            .cloned()
            .collect();
        tracing::info!(count = filtered.len(), "filtered notebook list");
        Ok(filtered.into_iter().collect())
    }

    /// Try `import <package>` for every package inside `env_name`.
    pub fn test_imports(&self, env_name: &str, packages: &[String], diag: &mut Diagnostics) -> ImportReport {
        tracing::info!(count = packages.len(), env = env_name, "testing imports");
        let lifecycle = EnvironmentLifecycle::new(self.config);
        let mut report = ImportReport::default();
        for package in packages {
            let statement = format!("import {package}");
            let spec = lifecycle.env_run(
                env_name,
                &self.config.tools.python,
                &["-c", statement.as_str()],
                self.config.timeouts.import_test,
            );
            match spec.and_then(|spec| process::run(&spec)) {
                Ok(outcome) if outcome.success() => {
                    tracing::debug!(package = %package, "import succeeded");
                    report.passed.push(package.clone());
                }
                Ok(outcome) => {
                    let detail = format!("{}: {}", outcome.failure_reason(), outcome.combined_output().trim());
                    diag.error(format!("Failed to import {package}: {detail}"));
                    report.failed.insert(package.clone(), detail);
                }
                Err(err) => {
                    diag.exception(&format!("Failed to import {package}"), &err);
                    report.failed.insert(package.clone(), format!("{err:#}"));
                }
            }
        }
        if report.all_passed() {
            tracing::info!(count = report.passed.len(), "all imports succeeded");
        } else {
            diag.error(format!(
                "Failed to import {}: {:?}",
                report.failed.len(),
                report.failed.keys().collect::<Vec<_>>()
            ));
        }
        report
    }

    /// Run every notebook on the worker pool and report failures. Output of
    /// each run is written to stdout as it is collected.
    pub fn test_notebooks(&self, env_name: &str, notebooks: &[String], diag: &mut Diagnostics) -> Vec<NotebookResult> {
        let jobs = self.config.jobs.clamp(1, notebooks.len().max(1));
        tracing::info!(count = notebooks.len(), jobs, env = env_name, "testing notebooks");

        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<NotebookResult>>> = Mutex::new(vec![None; notebooks.len()]);
        thread::scope(|scope| {
            for _ in 0..jobs {
                scope.spawn(|| loop {
                    if interrupt::requested() {
                        break;
                    }
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(notebook) = notebooks.get(idx) else {
                        break;
                    };
                    let result = self.test_one(env_name, notebook);
                    if let Ok(mut slots) = slots.lock() {
                        slots[idx] = Some(result);
                    }
                });
            }
        });

        let slots = slots.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut results = Vec::with_capacity(notebooks.len());
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for (notebook, slot) in notebooks.iter().zip(slots) {
            let result = slot.unwrap_or_else(|| NotebookResult {
                notebook: notebook.clone(),
                status: TestStatus::Skipped,
                exit_code: None,
                duration_ms: 0,
                output: divider(&format!("Not started {notebook}: interrupted")),
            });
            let _ = out.write_all(result.output.as_bytes());
            results.push(result);
        }
        let _ = out.flush();

        let failing: Vec<&NotebookResult> = results.iter().filter(|result| result.failed()).collect();
        if failing.is_empty() {
            tracing::info!("all notebooks passed tests");
        } else {
            let _ = out.write_all(divider("FAILED").as_bytes());
            for result in failing {
                diag.error(format!("Notebook {} failed tests ({})", result.notebook, result.status.as_str()));
            }
        }
        if interrupt::requested() {
            diag.error("Notebook testing interrupted.");
        }
        results
    }

    fn test_one(&self, env_name: &str, notebook: &str) -> NotebookResult {
        let name = Path::new(notebook)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| notebook.to_string());
        if notebook.starts_with('#') {
            return NotebookResult {
                notebook: notebook.to_string(),
                status: TestStatus::Skipped,
                exit_code: None,
                duration_ms: 0,
                output: divider(&format!("Skipping {notebook}")),
            };
        }

        let start = Instant::now();
        let mut output = divider(&format!("Testing '{name}' on environment '{env_name}'"));
        let (status, exit_code) = match self.run_isolated(env_name, notebook, &name) {
            Ok(outcome) => {
                output.push_str(&outcome.combined_output());
                let status = if outcome.success() {
                    TestStatus::Passed
                } else if outcome.timed_out {
                    output.push_str(&format!("Timed out after {} ms\n", outcome.duration_ms));
                    TestStatus::TimedOut
                } else {
                    TestStatus::Failed
                };
                (status, outcome.exit_code)
            }
            Err(err) => {
                output.push_str(&format!("Exception during testing: {err:#}\n"));
                (TestStatus::Failed, None)
            }
        };
        let duration_ms = start.elapsed().as_millis();
        let label = if status == TestStatus::Passed { "OK" } else { "FAIL" };
        output.push_str(&divider(&format!("Tested {name} {label} {duration_ms} ms")));
        tracing::debug!(notebook, status = status.as_str(), duration_ms, "notebook finished");
        NotebookResult {
            notebook: notebook.to_string(),
            status,
            exit_code,
            duration_ms,
            output,
        }
    }

    fn run_isolated(&self, env_name: &str, notebook: &str, name: &str) -> Result<process::CommandOutcome> {
        let source_dir = Path::new(notebook)
            .parent()
            .ok_or_else(|| anyhow!("notebook {notebook} has no parent directory"))?;
        let temp = TempDir::new().context("create notebook test directory")?;
        let test_dir = temp.path().join(TEST_DIR);
        copy_dir(source_dir, &test_dir)?;

        let timeout = self.config.timeouts.notebook;
        let spec = if name.ends_with(".ipynb") {
            CommandSpec::tool(
                &self.config.tools.notebook_runner,
                &["--no-progress-bar", name, "-k", env_name, "test.ipynb"],
                timeout,
            )?
        } else if name.ends_with(".py") {
            EnvironmentLifecycle::new(self.config).env_run(env_name, &self.config.tools.python, &[name], timeout)?
        } else {
            return Err(anyhow!("unhandled test file extension: {notebook}"));
        };
        let mut spec = spec.current_dir(&test_dir);
        for (key, value) in self.config.tool_env() {
            spec = spec.env(&key, &value);
        }
        process::run(&spec)
    }
}

/// Recursive copy of regular files and directories; the copy is owner
/// writable so notebooks can write next to themselves.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).with_context(|| format!("create {}", target.display()))?;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("chmod {}", target.display()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {} to {}", entry.path().display(), target.display()))?;
            let mut perms = fs::metadata(&target)
                .with_context(|| format!("stat {}", target.display()))?
                .permissions();
            perms.set_mode(perms.mode() | 0o600);
            fs::set_permissions(&target, perms).with_context(|| format!("chmod {}", target.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "validation_tests.rs"]
mod tests;
