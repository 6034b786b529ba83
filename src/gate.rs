//! Recompute decisions for the gated pipeline stages.
//!
//! A stage is satisfied only when every output key it owns is recorded in the
//! spec AND every file those outputs name still exists. Stages form a chain:
//!
//! ```text
//! repositories -> discovery -> compile -> environment_create -> install -> test
//! ```
//!
//! Once a stage runs in an invocation every later stage must run too, and the
//! status report shows a pending stage's valid successors as must-run. Checks
//! are map lookups and `Path::exists` calls only.
use crate::config::Config;
use crate::spec::{OutputKey, SpecStore};
use crate::util::repo_basename;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Repositories,
    Discovery,
    Compile,
    EnvironmentCreate,
    Install,
    Test,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Repositories,
        Stage::Discovery,
        Stage::Compile,
        Stage::EnvironmentCreate,
        Stage::Install,
        Stage::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Repositories => "repositories",
            Stage::Discovery => "discovery",
            Stage::Compile => "compile",
            Stage::EnvironmentCreate => "environment_create",
            Stage::Install => "install",
            Stage::Test => "test",
        }
    }

    /// Output keys whose presence witnesses the stage.
    pub fn output_keys(&self) -> &'static [OutputKey] {
        match self {
            Stage::Repositories => &[OutputKey::NotebookRepoUrls, OutputKey::NotebookRepoHashes],
            Stage::Discovery => &[
                OutputKey::TestNotebooks,
                OutputKey::TestImports,
                OutputKey::NbToImports,
            ],
            Stage::Compile => &[
                OutputKey::MambaSpec,
                OutputKey::PipRequirementFiles,
                OutputKey::PipMap,
                OutputKey::PipCompilerOutput,
                OutputKey::PackageVersions,
            ],
            Stage::EnvironmentCreate => &[OutputKey::EnvironmentPrefix],
            Stage::Install => &[OutputKey::InstalledRequirements],
            Stage::Test => &[OutputKey::TestResults],
        }
    }

    /// Stages that come before this one in the chain.
    pub fn dependencies(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().take_while(move |stage| *stage != self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageState {
    /// None of the stage's outputs are recorded.
    NotStarted,
    OutputsPresentAndValid,
    /// Outputs recorded but files they name are gone.
    Stale,
    /// Outputs partially recorded or unreadable.
    MustRun,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::NotStarted => "not-started",
            StageState::OutputsPresentAndValid => "outputs-present-and-valid",
            StageState::Stale => "stale",
            StageState::MustRun => "must-run",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage has to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum RunCause {
    MissingOutputs { keys: Vec<OutputKey> },
    StaleOutputs { files: Vec<PathBuf> },
    UnreadableOutput { key: OutputKey },
    DependencyRan { stage: Stage },
    /// An earlier stage must run, so this one will run after it.
    DependencyPending { stage: Stage },
    Forced,
}

impl fmt::Display for RunCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunCause::MissingOutputs { keys } => {
                let names: Vec<&str> = keys.iter().map(OutputKey::as_str).collect();
                write!(f, "missing outputs {}", names.join(", "))
            }
            RunCause::StaleOutputs { files } => {
                let names: Vec<String> = files.iter().map(|path| path.display().to_string()).collect();
                write!(f, "missing files {}", names.join(", "))
            }
            RunCause::UnreadableOutput { key } => write!(f, "unreadable output {key}"),
            RunCause::DependencyRan { stage } => write!(f, "dependency {stage} ran"),
            RunCause::DependencyPending { stage } => write!(f, "dependency {stage} must run"),
            RunCause::Forced => f.write_str("forced"),
        }
    }
}

/// Gate decision for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub stage: Stage,
    pub state: StageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<RunCause>,
}

impl Verdict {
    pub fn must_run(&self) -> bool {
        self.cause.is_some()
    }
}

/// Generated artifact files of one spec, named after its moniker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub mamba_spec: PathBuf,
    pub pip_output: PathBuf,
    pub extra_pip: PathBuf,
}

impl Artifacts {
    pub fn new(output_dir: &Path, moniker: &str) -> Self {
        Self {
            mamba_spec: output_dir.join(format!("{moniker}-mamba.yml")),
            pip_output: output_dir.join(format!("{moniker}-pip.txt")),
            extra_pip: output_dir.join(format!("{moniker}-extra-pip.txt")),
        }
    }
}

pub struct RecomputeGate<'a> {
    config: &'a Config,
    artifacts: Artifacts,
    env_name: String,
    ran: BTreeSet<Stage>,
}

impl<'a> RecomputeGate<'a> {
    pub fn new(config: &'a Config, spec: &SpecStore) -> Self {
        Self {
            config,
            artifacts: Artifacts::new(&config.output_dir, &spec.moniker()),
            env_name: spec.kernel_name().to_string(),
            ran: BTreeSet::new(),
        }
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    /// State of `stage` judged from the spec and filesystem alone.
    pub fn classify(&self, stage: Stage, spec: &SpecStore) -> (StageState, Option<RunCause>) {
        let keys = stage.output_keys();
        let missing: Vec<OutputKey> = keys
            .iter()
            .copied()
            .filter(|key| spec.output_value(*key).is_none())
            .collect();
        if missing.len() == keys.len() {
            return (StageState::NotStarted, Some(RunCause::MissingOutputs { keys: missing }));
        }
        if !missing.is_empty() {
            return (StageState::MustRun, Some(RunCause::MissingOutputs { keys: missing }));
        }
        match self.produced_files(stage, spec) {
            Err(key) => (StageState::MustRun, Some(RunCause::UnreadableOutput { key })),
            Ok(files) => {
                let absent: Vec<PathBuf> = files.into_iter().filter(|path| !path.exists()).collect();
                if absent.is_empty() {
                    (StageState::OutputsPresentAndValid, None)
                } else {
                    (StageState::Stale, Some(RunCause::StaleOutputs { files: absent }))
                }
            }
        }
    }

    /// Whether `stage` must run now, given what already ran in this
    /// invocation and the `force` setting.
    pub fn decide(&self, stage: Stage, spec: &SpecStore) -> Verdict {
        let (state, cause) = self.classify(stage, spec);
        let cause = if self.config.force {
            Some(RunCause::Forced)
        } else if let Some(dep) = stage.dependencies().find(|dep| self.ran.contains(dep)) {
            Some(RunCause::DependencyRan { stage: dep })
        } else {
            cause
        };
        let verdict = Verdict { stage, state, cause };
        match &verdict.cause {
            Some(cause) => tracing::info!(stage = stage.as_str(), state = state.as_str(), %cause, "stage must run"),
            None => tracing::info!(stage = stage.as_str(), "stage outputs valid, skipping"),
        }
        verdict
    }

    /// Record that `stage` ran successfully in this invocation.
    pub fn mark_ran(&mut self, stage: Stage) {
        self.ran.insert(stage);
    }

    pub fn ran(&self, stage: Stage) -> bool {
        self.ran.contains(&stage)
    }

    /// Verdicts for every stage, for status reporting.
    ///
    /// Valid outputs downstream of a stage that must run are reported as
    /// must-run, naming the first pending dependency.
    pub fn report(&self, spec: &SpecStore) -> Vec<Verdict> {
        let mut pending: Option<Stage> = None;
        Stage::ALL
            .into_iter()
            .map(|stage| {
                let (mut state, mut cause) = self.classify(stage, spec);
                match (pending, cause.is_some()) {
                    (Some(dep), false) => {
                        state = StageState::MustRun;
                        cause = Some(RunCause::DependencyPending { stage: dep });
                    }
                    (None, true) => pending = Some(stage),
                    _ => {}
                }
                Verdict { stage, state, cause }
            })
            .collect()
    }

    fn produced_files(&self, stage: Stage, spec: &SpecStore) -> Result<Vec<PathBuf>, OutputKey> {
        let files = match stage {
            Stage::Repositories => {
                let urls: Vec<String> = read(spec, OutputKey::NotebookRepoUrls)?;
                urls.iter()
                    .map(|url| self.config.repos_dir.join(repo_basename(url)))
                    .collect()
            }
            Stage::Discovery => {
                let notebooks: Vec<String> = read(spec, OutputKey::TestNotebooks)?;
                notebooks.into_iter().map(PathBuf::from).collect()
            }
            Stage::Compile => {
                let sources: Vec<String> = read(spec, OutputKey::PipRequirementFiles)?;
                let mut files = vec![
                    self.artifacts.mamba_spec.clone(),
                    self.artifacts.pip_output.clone(),
                ];
                files.extend(sources.into_iter().map(PathBuf::from));
                files
            }
            Stage::EnvironmentCreate | Stage::Install => {
                let prefix: String = read(spec, OutputKey::EnvironmentPrefix)?;
                vec![PathBuf::from(prefix), self.config.env_prefix(&self.env_name)]
            }
            Stage::Test => Vec::new(),
        };
        Ok(files)
    }
}

fn read<T: serde::de::DeserializeOwned>(spec: &SpecStore, key: OutputKey) -> Result<T, OutputKey> {
    spec.output(key).map_err(|err| {
        tracing::debug!(key = key.as_str(), "unreadable output: {err:#}");
        key
    })
}

#[cfg(test)]
#[path = "gate_tests.rs"]
mod tests;
