//! Lifecycle of the named runtime environment.
//!
//! The environment manager (`micromamba` by default) owns creation, removal
//! and `run -n`; the installer (`uv pip`) runs inside the environment;
//! kernel registration goes through `ipykernel`. Every operation builds one
//! [`CommandSpec`], runs it, and reports through [`EnvironmentLifecycle::interpret`].
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::process::{self, CommandOutcome, CommandSpec};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct EnvList {
    envs: Vec<PathBuf>,
}

pub struct EnvironmentLifecycle<'a> {
    config: &'a Config,
}

impl<'a> EnvironmentLifecycle<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn prefix(&self, env_name: &str) -> PathBuf {
        self.config.env_prefix(env_name)
    }

    fn with_tool_env(&self, mut spec: CommandSpec) -> CommandSpec {
        for (key, value) in self.config.tool_env() {
            spec = spec.env(&key, &value);
        }
        spec
    }

    fn mamba<S: AsRef<str>>(&self, args: &[S], timeout: Duration) -> Result<CommandSpec> {
        Ok(self.with_tool_env(CommandSpec::tool(&self.config.tools.mamba, args, timeout)?))
    }

    /// `<mamba> run -n <env> <tool> <args>`; `tool` may carry its own
    /// leading arguments.
    pub fn env_run<S: AsRef<str>>(
        &self,
        env_name: &str,
        tool: &str,
        args: &[S],
        timeout: Duration,
    ) -> Result<CommandSpec> {
        let mut argv = vec!["run".to_string(), "-n".to_string(), env_name.to_string()];
        argv.extend(shell_words::split(tool).with_context(|| format!("parse tool command: {tool}"))?);
        argv.extend(args.iter().map(|arg| arg.as_ref().to_string()));
        self.mamba(&argv, timeout)
    }

    /// Run `spec` and fold the outcome into `diag`: success logs `success`;
    /// failure records `failure` with the tool's stderr and stdout attached.
    pub fn interpret(
        &self,
        spec: Result<CommandSpec>,
        failure: &str,
        success: &str,
        diag: &mut Diagnostics,
    ) -> bool {
        let outcome = spec.and_then(|spec| process::run(&spec));
        match outcome {
            Ok(outcome) if outcome.success() => {
                tracing::info!(elapsed_ms = outcome.duration_ms, "{success}");
                true
            }
            Ok(outcome) => diag.error(failure_message(failure, &outcome)),
            Err(err) => diag.exception(failure, &err),
        }
    }

    pub fn create(&self, env_name: &str, spec_file: &Path, diag: &mut Diagnostics) -> bool {
        tracing::info!(env = env_name, spec = %spec_file.display(), "creating environment");
        let spec = self.mamba(
            &[
                "create",
                "--yes",
                "-n",
                env_name,
                "-f",
                &spec_file.display().to_string(),
            ],
            self.config.timeouts.env_create,
        );
        self.interpret(
            spec,
            &format!("Failed to create environment {env_name}"),
            &format!("Environment {env_name} created. It needs to be registered before JupyterLab will display it."),
            diag,
        )
    }

    pub fn delete(&self, env_name: &str, diag: &mut Diagnostics) -> bool {
        tracing::info!(env = env_name, "deleting environment");
        let spec = self.mamba(
            &["env", "remove", "--yes", "-n", env_name],
            self.config.timeouts.env_create,
        );
        self.interpret(
            spec,
            &format!("Failed to delete environment {env_name}"),
            &format!("Environment {env_name} deleted."),
            diag,
        )
    }

    /// Whether the environment manager knows an environment named `env_name`.
    pub fn exists(&self, env_name: &str) -> Result<bool> {
        let spec = self.mamba(&["env", "list", "--json"], self.config.timeouts.default)?;
        let outcome = process::run(&spec)?;
        if !outcome.success() {
            return Err(anyhow!(failure_message("Listing environments failed", &outcome)));
        }
        let list: EnvList =
            serde_json::from_str(&outcome.stdout).context("parse environment list")?;
        let found = list
            .envs
            .iter()
            .any(|env| env.file_name().is_some_and(|name| name == env_name));
        tracing::debug!(env = env_name, found, "environment existence check");
        Ok(found)
    }

    pub fn install(&self, env_name: &str, requirements: &[PathBuf], diag: &mut Diagnostics) -> bool {
        tracing::info!(env = env_name, files = requirements.len(), "installing packages");
        let spec = self.env_run(
            env_name,
            &self.config.tools.pip,
            &requirement_args("install", requirements),
            self.config.timeouts.install,
        );
        self.interpret(
            spec,
            &format!("Package installation for {env_name} failed"),
            &format!("Package installation for {env_name} completed successfully."),
            diag,
        )
    }

    pub fn uninstall(&self, env_name: &str, requirements: &[PathBuf], diag: &mut Diagnostics) -> bool {
        tracing::info!(env = env_name, files = requirements.len(), "uninstalling packages");
        let spec = self.env_run(
            env_name,
            &self.config.tools.pip,
            &requirement_args("uninstall", requirements),
            self.config.timeouts.install,
        );
        self.interpret(
            spec,
            &format!("Package un-installation of {env_name} failed"),
            &format!("Package un-installation of {env_name} completed successfully."),
            diag,
        )
    }

    /// Register the environment as a Jupyter kernel, injecting `env_vars`
    /// into the kernel definition.
    pub fn register(
        &self,
        env_name: &str,
        display_name: &str,
        env_vars: &BTreeMap<String, String>,
        diag: &mut Diagnostics,
    ) -> bool {
        let mut args = vec![
            "-m".to_string(),
            "ipykernel".to_string(),
            "install".to_string(),
            "--user".to_string(),
            "--name".to_string(),
            env_name.to_string(),
            "--display-name".to_string(),
            display_name.to_string(),
        ];
        for (key, value) in env_vars {
            args.extend(["--env".to_string(), key.clone(), value.clone()]);
        }
        let spec = self.env_run(env_name, &self.config.tools.python, &args, self.config.timeouts.default);
        self.interpret(
            spec,
            &format!("Failed to register environment {env_name} as a jupyter kernel"),
            &format!("Registered environment {env_name} as jupyter kernel '{display_name}'."),
            diag,
        )
    }

    pub fn unregister(&self, env_name: &str, diag: &mut Diagnostics) -> bool {
        let spec = CommandSpec::tool(
            &self.config.tools.jupyter,
            &["kernelspec", "uninstall", "-y", env_name],
            self.config.timeouts.default,
        )
        .map(|spec| self.with_tool_env(spec));
        self.interpret(
            spec,
            &format!("Failed to unregister Jupyter kernel {env_name}"),
            &format!("Unregistered Jupyter kernel {env_name}; the environment itself still exists."),
            diag,
        )
    }

    /// Pack `source_dir` into `archive`; the compression follows the
    /// archive's extension.
    pub fn archive(&self, archive: &Path, source_dir: &Path, diag: &mut Diagnostics) -> bool {
        let spec = archive_command(self.config, archive, source_dir, "-acf");
        self.interpret(
            spec,
            &format!("Failed to pack {} into {}", source_dir.display(), archive.display()),
            &format!("Packed {} into {}", source_dir.display(), archive.display()),
            diag,
        )
    }

    pub fn unarchive(&self, archive: &Path, dest_dir: &Path, diag: &mut Diagnostics) -> bool {
        let spec = archive_command(self.config, archive, dest_dir, "-xf");
        self.interpret(
            spec,
            &format!("Failed to unpack {} into {}", archive.display(), dest_dir.display()),
            &format!("Unpacked {} into {}", archive.display(), dest_dir.display()),
            diag,
        )
    }

    pub fn pack(&self, env_name: &str, archive: &Path, diag: &mut Diagnostics) -> bool {
        self.archive(archive, &self.prefix(env_name), diag)
    }

    pub fn unpack(&self, env_name: &str, archive: &Path, diag: &mut Diagnostics) -> bool {
        self.unarchive(archive, &self.prefix(env_name), diag)
    }

    /// Drop the package cache and installer caches under the live root.
    pub fn compact(&self, diag: &mut Diagnostics) -> bool {
        let targets = [self.config.env_root.join("pkgs"), self.config.cache_dir.clone()];
        for dir in &targets {
            if !dir.exists() {
                continue;
            }
            if let Err(err) = fs::remove_dir_all(dir) {
                let err = anyhow::Error::new(err).context(format!("remove {}", dir.display()));
                return diag.exception("Failed to compact installation", &err);
            }
            tracing::debug!(path = %dir.display(), "removed cache directory");
        }
        tracing::info!("compacted installation, removing package and install caches");
        true
    }
}

fn requirement_args(verb: &str, requirements: &[PathBuf]) -> Vec<String> {
    let mut args = vec![verb.to_string()];
    for path in requirements {
        args.push("-r".to_string());
        args.push(path.display().to_string());
    }
    args
}

fn archive_command(config: &Config, archive: &Path, dir: &Path, mode: &str) -> Result<CommandSpec> {
    let name = dir
        .file_name()
        .ok_or_else(|| anyhow!("{} has no directory name", dir.display()))?
        .to_string_lossy()
        .into_owned();
    let parent = dir
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", dir.display()))?;
    let archive_parent = archive
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", archive.display()))?;
    fs::create_dir_all(archive_parent)
        .with_context(|| format!("create {}", archive_parent.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    let spec = CommandSpec::tool(
        &config.tools.tar,
        &[mode, &archive.display().to_string(), &name],
        config.timeouts.install,
    )?;
    Ok(spec.current_dir(parent))
}

/// Failure text carrying both complete output streams of the tool.
fn failure_message(context: &str, outcome: &CommandOutcome) -> String {
    format!(
        "{context} ({}): {} ::: {}",
        outcome.failure_reason(),
        outcome.stderr.trim(),
        outcome.stdout.trim()
    )
}

#[cfg(test)]
#[path = "environment_tests.rs"]
mod tests;
