//! Stage orchestration: workflow presets, explicit steps, and the run summary.
//!
//! Workflow presets push the gated stages through [`RecomputeGate`] so a
//! second run against unchanged inputs skips everything. Explicit steps are
//! unconditional. Any failed stage or step stops the run; the diagnostics
//! gathered up to that point are still reported.
use crate::compiler::{
    self, CompileError, Constraint, DependencyCompiler, Provenance, RequirementSource,
};
use crate::config::{Config, TARGET_PACKAGES};
use crate::diagnostics::Diagnostics;
use crate::discovery;
use crate::environment::EnvironmentLifecycle;
use crate::gate::{Artifacts, RecomputeGate, Stage, Verdict};
use crate::interrupt;
use crate::refdata::{DataOutput, RefdataCollection};
use crate::repository::RepositorySet;
use crate::shelf::{Pantry, Shelf};
use crate::spec::{OutputKey, SpecStore};
use crate::util::write_text;
use crate::validation::{ImportReport, TestStatus, ValidationRunner};
use clap::ValueEnum;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    /// Run only the explicitly selected steps.
    #[default]
    Explicit,
    /// Repositories, compile, environment and install through the gate, then
    /// save the spec and run selected steps.
    Curation,
    /// Rebuild the environment from a spec that already carries compiled
    /// outputs, then run selected steps.
    Reinstall,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::Explicit => "explicit",
            Workflow::Curation => "curation",
            Workflow::Reinstall => "reinstall",
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit steps selected on the command line, run in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSelection {
    pub clone_repos: bool,
    pub compile_packages: bool,
    pub init_env: bool,
    pub install_packages: bool,
    pub test_imports: bool,
    /// Comma-separated notebook regexes.
    pub test_notebooks: Option<String>,
    pub update_spec_hash: bool,
    pub validate_spec: bool,
    pub pack_env: bool,
    pub unpack_env: bool,
    pub register_env: bool,
    pub unregister_env: bool,
    pub shelve_spec: bool,
    pub data_collect: bool,
    pub delete_repos: bool,
    pub uninstall_packages: bool,
    pub delete_env: bool,
    pub compact: bool,
    pub reset_spec: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    CloneRepos,
    CompilePackages,
    InitEnv,
    InstallPackages,
    TestImports,
    TestNotebooks,
    UpdateSpecHash,
    ValidateSpec,
    PackEnv,
    UnpackEnv,
    RegisterEnv,
    UnregisterEnv,
    DataCollect,
    ShelveSpec,
    DeleteRepos,
    UninstallPackages,
    DeleteEnv,
    Compact,
    ResetSpec,
}

impl Step {
    fn as_str(&self) -> &'static str {
        match self {
            Step::CloneRepos => "clone_repos",
            Step::CompilePackages => "compile_packages",
            Step::InitEnv => "init_env",
            Step::InstallPackages => "install_packages",
            Step::TestImports => "test_imports",
            Step::TestNotebooks => "test_notebooks",
            Step::UpdateSpecHash => "update_spec_hash",
            Step::ValidateSpec => "validate_spec",
            Step::PackEnv => "pack_env",
            Step::UnpackEnv => "unpack_env",
            Step::RegisterEnv => "register_env",
            Step::UnregisterEnv => "unregister_env",
            Step::ShelveSpec => "shelve_spec",
            Step::DataCollect => "data_collect",
            Step::DeleteRepos => "delete_repos",
            Step::UninstallPackages => "uninstall_packages",
            Step::DeleteEnv => "delete_env",
            Step::Compact => "compact",
            Step::ResetSpec => "reset_spec",
        }
    }
}

impl StepSelection {
    fn selected(&self) -> Vec<Step> {
        [
            (self.clone_repos, Step::CloneRepos),
            (self.compile_packages, Step::CompilePackages),
            (self.init_env, Step::InitEnv),
            (self.install_packages, Step::InstallPackages),
            (self.test_imports, Step::TestImports),
            (self.test_notebooks.is_some(), Step::TestNotebooks),
            (self.update_spec_hash, Step::UpdateSpecHash),
            (self.validate_spec, Step::ValidateSpec),
            (self.pack_env, Step::PackEnv),
            (self.unpack_env, Step::UnpackEnv),
            (self.register_env, Step::RegisterEnv),
            (self.unregister_env, Step::UnregisterEnv),
            (self.data_collect, Step::DataCollect),
            (self.shelve_spec, Step::ShelveSpec),
            (self.delete_repos, Step::DeleteRepos),
            (self.uninstall_packages, Step::UninstallPackages),
            (self.delete_env, Step::DeleteEnv),
            (self.compact, Step::Compact),
            (self.reset_spec, Step::ResetSpec),
        ]
        .into_iter()
        .filter_map(|(on, step)| on.then_some(step))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.selected().is_empty()
    }
}

/// Notebook outcome as recorded in the `test_results` output.
#[derive(Debug, Clone, Serialize)]
pub struct NotebookOutcome {
    pub notebook: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TestResults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imports: Option<ImportReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notebooks: Vec<NotebookOutcome>,
}

/// Machine-readable summary of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub workflow: Workflow,
    pub spec: PathBuf,
    pub moniker: String,
    pub success: bool,
    pub stages_run: Vec<Stage>,
    pub steps_run: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestResults>,
    pub errors: usize,
    pub warnings: usize,
    pub exceptions: usize,
    pub elapsed_ms: u128,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    spec: SpecStore,
    gate: RecomputeGate<'a>,
    shelf: Shelf,
    steps_run: Vec<String>,
    tests: Option<TestResults>,
}

impl<'a> Pipeline<'a> {
    /// `spec` must already be validated.
    pub fn new(config: &'a Config, spec: SpecStore) -> Self {
        debug_assert!(spec.is_validated(), "pipeline built from an unvalidated spec");
        let gate = RecomputeGate::new(config, &spec);
        let shelf = Pantry::new(&config.pantry_dir).shelf(&spec.moniker());
        Self {
            config,
            spec,
            gate,
            shelf,
            steps_run: Vec::new(),
            tests: None,
        }
    }

    pub fn spec(&self) -> &SpecStore {
        &self.spec
    }

    fn env_name(&self) -> String {
        self.spec.kernel_name().to_string()
    }

    fn artifacts(&self) -> Artifacts {
        self.gate.artifacts().clone()
    }

    fn lifecycle(&self) -> EnvironmentLifecycle<'a> {
        EnvironmentLifecycle::new(self.config)
    }

    /// Gate state of every stage without running anything.
    pub fn status(&self) -> Vec<Verdict> {
        self.gate.report(&self.spec)
    }

    pub fn run(&mut self, workflow: Workflow, steps: &StepSelection, diag: &mut Diagnostics) -> bool {
        tracing::info!(workflow = workflow.as_str(), spec = %self.spec.source().display(), "starting run");
        for dir in [&self.config.output_dir, &self.config.repos_dir] {
            if let Err(err) = std::fs::create_dir_all(dir) {
                return diag.exception(
                    &format!("Failed to create {}", dir.display()),
                    &anyhow::Error::new(err),
                );
            }
        }
        let ok = match workflow {
            Workflow::Explicit => self.run_explicit(steps, diag),
            Workflow::Curation => self.run_curation(diag) && self.run_explicit(steps, diag),
            Workflow::Reinstall => self.run_reinstall(diag) && self.run_explicit(steps, diag),
        };
        if ok {
            tracing::info!(workflow = workflow.as_str(), "workflow completed");
        } else {
            diag.error(format!("Workflow {workflow} failed."));
        }
        ok
    }

    pub fn summary(&self, workflow: Workflow, success: bool, diag: &Diagnostics, start: Instant) -> RunSummary {
        RunSummary {
            workflow,
            spec: self.spec.source().to_path_buf(),
            moniker: self.spec.moniker(),
            success,
            stages_run: Stage::ALL.into_iter().filter(|stage| self.gate.ran(*stage)).collect(),
            steps_run: self.steps_run.clone(),
            tests: self.tests.clone(),
            errors: diag.error_count(),
            warnings: diag.warning_count(),
            exceptions: diag.exception_count(),
            elapsed_ms: start.elapsed().as_millis(),
        }
    }

    // ------------------------------------------------------------------
    // workflows

    fn run_curation(&mut self, diag: &mut Diagnostics) -> bool {
        tracing::info!("running spec development / curation workflow");
        for stage in [
            Stage::Repositories,
            Stage::Discovery,
            Stage::Compile,
            Stage::EnvironmentCreate,
            Stage::Install,
        ] {
            if !self.gated(stage, diag) {
                return diag.error(format!("FAILED running stage {stage}."));
            }
        }
        self.save_final_spec(diag)
    }

    fn run_reinstall(&mut self, diag: &mut Diagnostics) -> bool {
        tracing::info!("running install-compiled-spec workflow");
        let required = [OutputKey::MambaSpec, OutputKey::PipCompilerOutput];
        if !self.spec.outputs_exist(&required) {
            return diag.error(format!(
                "This workflow requires a precompiled spec with outputs for {}, {}.",
                required[0], required[1]
            ));
        }
        self.validate_spec(diag)
            && self.run_stage(Stage::EnvironmentCreate, diag)
            && self.run_stage(Stage::Install, diag)
    }

    fn run_explicit(&mut self, steps: &StepSelection, diag: &mut Diagnostics) -> bool {
        for step in steps.selected() {
            tracing::info!(step = step.as_str(), "running step");
            let ok = match step {
                Step::CloneRepos => self.run_stage(Stage::Repositories, diag) && self.run_stage(Stage::Discovery, diag),
                Step::CompilePackages => self.run_stage(Stage::Compile, diag),
                Step::InitEnv => self.run_stage(Stage::EnvironmentCreate, diag),
                Step::InstallPackages => self.run_stage(Stage::Install, diag),
                Step::TestImports => self.test_imports(diag),
                Step::TestNotebooks => {
                    self.test_notebooks(steps.test_notebooks.as_deref().unwrap_or(".*"), diag)
                }
                Step::UpdateSpecHash => self.update_spec_hash(diag),
                Step::ValidateSpec => self.validate_spec(diag),
                Step::PackEnv => self.pack_env(diag),
                Step::UnpackEnv => self.unpack_env(diag),
                Step::RegisterEnv => self.register_env(diag),
                Step::UnregisterEnv => self.lifecycle().unregister(&self.env_name(), diag),
                Step::ShelveSpec => self.shelve_spec(diag),
                Step::DataCollect => self.data_collect(diag),
                Step::DeleteRepos => self.delete_repos(diag),
                Step::UninstallPackages => self.uninstall_packages(diag),
                Step::DeleteEnv => self.delete_env(diag),
                Step::Compact => self.lifecycle().compact(diag),
                Step::ResetSpec => self.spec.reset(diag),
            };
            if !ok {
                return diag.error(format!("FAILED step {} ... stopping...", step.as_str()));
            }
            self.steps_run.push(step.as_str().to_string());
        }
        true
    }

    /// Run `stage` only when the gate says so.
    fn gated(&mut self, stage: Stage, diag: &mut Diagnostics) -> bool {
        if !self.gate.decide(stage, &self.spec).must_run() {
            return true;
        }
        self.run_stage(stage, diag)
    }

    fn run_stage(&mut self, stage: Stage, diag: &mut Diagnostics) -> bool {
        let start = Instant::now();
        let ok = match stage {
            Stage::Repositories => self.clone_repos(diag),
            Stage::Discovery => self.discover(diag),
            Stage::Compile => self.compile_packages(diag),
            Stage::EnvironmentCreate => self.init_env(diag),
            Stage::Install => self.install_packages(diag),
            Stage::Test => self.test_imports(diag) && self.test_notebooks(".*", diag),
        };
        tracing::info!(stage = stage.as_str(), ok, elapsed_ms = start.elapsed().as_millis(), "stage finished");
        if ok {
            self.gate.mark_ran(stage);
        }
        ok
    }

    // ------------------------------------------------------------------
    // output bookkeeping

    fn record<T: Serialize>(&mut self, key: OutputKey, value: &T, diag: &mut Diagnostics) -> bool {
        match self.spec.set_output(key, value) {
            Ok(()) => true,
            Err(err) => diag.exception(&format!("Failed recording output {key}"), &err),
        }
    }

    fn persist(&mut self, diag: &mut Diagnostics) -> bool {
        let add_digest = !self.config.ignore_spec_hash;
        self.spec.revise_and_save(Vec::new(), add_digest, diag)
    }

    fn output_or_error<T: serde::de::DeserializeOwned>(&self, key: OutputKey, diag: &mut Diagnostics) -> Option<T> {
        match self.spec.output(key) {
            Ok(value) => Some(value),
            Err(err) => {
                diag.exception("Missing prerequisite output", &err);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // stages

    fn clone_repos(&mut self, diag: &mut Diagnostics) -> bool {
        tracing::info!("setting up repository clones");
        let urls = self.spec.repository_urls();
        let mut refs = self.spec.repository_refs();
        if self.config.repo_mode == crate::config::RepoMode::Locked {
            if let Ok(recorded) = self.spec.output::<BTreeMap<String, String>>(OutputKey::NotebookRepoHashes) {
                tracing::info!(count = recorded.len(), "locking repositories to recorded commits");
                refs.extend(recorded.into_iter().filter(|(url, _)| urls.contains(url)));
            }
        }
        let report = RepositorySet::new(self.config).resolve_all(&urls, &refs);
        for (url, reason) in &report.failures {
            diag.error(format!("Failed to set up repository {url}: {reason}"));
        }
        if !report.is_complete() {
            return false;
        }
        self.record(OutputKey::NotebookRepoUrls, &urls, diag)
            && self.record(OutputKey::NotebookRepoHashes, &report.commits(), diag)
            && self.persist(diag)
    }

    fn discover(&mut self, diag: &mut Diagnostics) -> bool {
        let errors_before = diag.error_count() + diag.exception_count();
        let notebooks = discovery::collect_selected(&self.spec, &self.config.repos_dir, diag);
        if diag.error_count() + diag.exception_count() > errors_before {
            return false;
        }
        if notebooks.is_empty() {
            diag.warning("No notebooks found in specified repositories using spec'd patterns.");
        }
        let scan = discovery::extract_imports(&notebooks, diag);
        if scan.packages.is_empty() {
            diag.warning("No imports found in notebooks. Import tests will be skipped.");
        }
        let imports: Vec<String> = scan.packages.into_iter().collect();
        self.record(OutputKey::TestNotebooks, &notebooks, diag)
            && self.record(OutputKey::TestImports, &imports, diag)
            && self.record(OutputKey::NbToImports, &scan.by_notebook, diag)
            && self.persist(diag)
    }

    fn compile_packages(&mut self, diag: &mut Diagnostics) -> bool {
        let artifacts = self.artifacts();
        let mamba_spec = match compiler::generate_base_environment(
            self.spec.kernel_name(),
            self.spec.python_version(),
            self.spec.extra_mamba_packages(),
        )
        .and_then(|text| write_text(&artifacts.mamba_spec, &text).map(|_| text))
        {
            Ok(text) => text,
            Err(err) => return diag.exception("Failed generating mamba spec", &err),
        };
        tracing::info!(path = %artifacts.mamba_spec.display(), "generated mamba spec for target environment");

        let Some(notebooks) = self.output_or_error::<Vec<String>>(OutputKey::TestNotebooks, diag) else {
            return false;
        };
        if let Err(err) = compiler::write_requirements_file(&artifacts.extra_pip, self.spec.extra_pip_packages()) {
            return diag.exception("Failed writing extra pip requirements", &err);
        }

        let compiler = DependencyCompiler::new(self.config);
        let mut sources: Vec<RequirementSource> = compiler
            .find_requirement_files(&notebooks)
            .into_iter()
            .map(|path| RequirementSource::new(path, Provenance::Notebook))
            .collect();
        sources.extend(
            self.config
                .injected_requirements
                .iter()
                .map(|path| RequirementSource::new(path.clone(), Provenance::Injected)),
        );
        sources.push(RequirementSource::new(artifacts.extra_pip.clone(), Provenance::Extra));

        let base_label = artifacts.mamba_spec.display().to_string();
        let base: Vec<Constraint> = TARGET_PACKAGES
            .iter()
            .map(|pkg| pkg.to_string())
            .chain(self.spec.extra_mamba_packages().iter().cloned())
            .map(|pkg| Constraint::parse(&pkg, &base_label, Provenance::Base))
            .collect();

        let manifest = match compiler.merge_and_compile(
            &sources,
            &base,
            self.spec.python_version(),
            &artifacts.pip_output,
        ) {
            Ok(manifest) => manifest,
            Err(CompileError::Conflicts(conflicts)) => {
                for conflict in &conflicts {
                    diag.error(conflict.to_string());
                }
                return diag.error(format!(
                    "Found {} conflicting package pins; resolver not run.",
                    conflicts.len()
                ));
            }
            Err(CompileError::Resolver {
                reason,
                stdout,
                stderr,
                listing,
            }) => {
                return diag.error(format!(
                    "Failed to compile combined pip requirements ({reason}): {} ::: {}\nRequirement sources:\n{listing}",
                    stderr.trim(),
                    stdout.trim()
                ));
            }
            Err(CompileError::Other(err)) => {
                return diag.exception("Failed to compile combined pip requirements", &err)
            }
        };

        let source_paths: Vec<String> = sources
            .iter()
            .map(|source| source.path.display().to_string())
            .collect();
        self.record(OutputKey::MambaSpec, &mamba_spec, diag)
            && self.record(OutputKey::PipRequirementFiles, &source_paths, diag)
            && self.record(OutputKey::PipMap, &manifest.source_map(), diag)
            && self.record(OutputKey::PipCompilerOutput, &manifest.compiler_output, diag)
            && self.record(OutputKey::PackageVersions, &manifest.pinned, diag)
            && self.persist(diag)
    }

    fn init_env(&mut self, diag: &mut Diagnostics) -> bool {
        let env_name = self.env_name();
        let lifecycle = self.lifecycle();
        let prefix = lifecycle.prefix(&env_name).display().to_string();
        match lifecycle.exists(&env_name) {
            Ok(true) => {
                tracing::info!(
                    env = %env_name,
                    "environment already exists, skipping re-install; use --delete-env to remove"
                );
                return self.record(OutputKey::EnvironmentPrefix, &prefix, diag) && self.persist(diag);
            }
            Ok(false) => {}
            Err(err) => return diag.exception("Failed checking for existing environment", &err),
        }
        let Some(mamba_spec) = self.output_or_error::<String>(OutputKey::MambaSpec, diag) else {
            return false;
        };
        let spec_file = self.artifacts().mamba_spec;
        if let Err(err) = write_text(&spec_file, &mamba_spec) {
            return diag.exception("Failed writing mamba spec", &err);
        }
        lifecycle.create(&env_name, &spec_file, diag)
            && self.register_env(diag)
            && self.record(OutputKey::EnvironmentPrefix, &prefix, diag)
            && self.persist(diag)
            && self.copy_spec_to_env(diag)
    }

    fn install_packages(&mut self, diag: &mut Diagnostics) -> bool {
        let Some(compiled) = self.output_or_error::<String>(OutputKey::PipCompilerOutput, diag) else {
            return false;
        };
        let installed = compiler::package_lines(&compiled);
        if installed.is_empty() {
            diag.warning("Found no pip requirements to install.");
        } else {
            let pip_output = self.artifacts().pip_output;
            if let Err(err) = write_text(&pip_output, &compiled) {
                return diag.exception("Failed writing pip requirements", &err);
            }
            if !self.lifecycle().install(&self.env_name(), &[pip_output], diag) {
                return false;
            }
        }
        self.record(OutputKey::InstalledRequirements, &installed, diag)
            && self.persist(diag)
            && self.copy_spec_to_env(diag)
    }

    fn uninstall_packages(&mut self, diag: &mut Diagnostics) -> bool {
        let Some(compiled) = self.output_or_error::<String>(OutputKey::PipCompilerOutput, diag) else {
            return false;
        };
        let pip_output = self.artifacts().pip_output;
        if let Err(err) = write_text(&pip_output, &compiled) {
            return diag.exception("Failed writing pip requirements", &err);
        }
        if !self.lifecycle().uninstall(&self.env_name(), &[pip_output], diag) {
            return false;
        }
        self.spec.remove_output(OutputKey::InstalledRequirements);
        self.persist(diag)
    }

    fn copy_spec_to_env(&mut self, diag: &mut Diagnostics) -> bool {
        tracing::debug!("copying spec to target environment");
        let prefix = self.lifecycle().prefix(&self.env_name());
        let add_digest = !self.config.ignore_spec_hash;
        self.spec.save_to(&prefix, add_digest, diag)
    }

    fn save_final_spec(&mut self, diag: &mut Diagnostics) -> bool {
        tracing::debug!("updating spec with final results");
        self.persist(diag)
    }

    // ------------------------------------------------------------------
    // tests

    fn test_results_mut(&mut self) -> &mut TestResults {
        self.tests.get_or_insert_with(TestResults::default)
    }

    fn record_tests(&mut self, diag: &mut Diagnostics) -> bool {
        let results = self.tests.clone().unwrap_or_default();
        self.record(OutputKey::TestResults, &results, diag) && self.persist(diag)
    }

    fn test_imports(&mut self, diag: &mut Diagnostics) -> bool {
        let Some(imports) = self.output_or_error::<Vec<String>>(OutputKey::TestImports, diag) else {
            return false;
        };
        if imports.is_empty() {
            return diag.warning("Found no imports to check in spec'd notebooks.");
        }
        let report = ValidationRunner::new(self.config).test_imports(&self.env_name(), &imports, diag);
        let passed = report.all_passed();
        self.test_results_mut().imports = Some(report);
        self.record_tests(diag) && passed
    }

    fn test_notebooks(&mut self, patterns: &str, diag: &mut Diagnostics) -> bool {
        let Some(notebooks) = self.output_or_error::<Vec<String>>(OutputKey::TestNotebooks, diag) else {
            return false;
        };
        let runner = ValidationRunner::new(self.config);
        let filtered = match runner.filter_notebooks(&notebooks, patterns) {
            Ok(filtered) => filtered,
            Err(err) => return diag.exception("Invalid notebook filter", &err),
        };
        if filtered.is_empty() {
            return diag.warning(format!("Found no notebooks to test matching regex '{patterns}'."));
        }
        let results = runner.test_notebooks(&self.env_name(), &filtered, diag);
        let passed = !results.iter().any(|result| result.failed()) && !interrupt::requested();
        self.test_results_mut().notebooks = results
            .into_iter()
            .map(|result| NotebookOutcome {
                notebook: result.notebook,
                status: result.status,
                exit_code: result.exit_code,
                duration_ms: u64::try_from(result.duration_ms).unwrap_or(u64::MAX),
            })
            .collect();
        self.record_tests(diag) && passed
    }

    // ------------------------------------------------------------------
    // spec integrity

    fn update_spec_hash(&mut self, diag: &mut Diagnostics) -> bool {
        let source = self.spec.source().to_path_buf();
        self.spec.save_as(&source, true, diag)
    }

    fn validate_spec(&mut self, diag: &mut Diagnostics) -> bool {
        if !self.spec.validate(diag) {
            return false;
        }
        if self.config.ignore_spec_hash {
            return self.spec.check_integrity(true, diag);
        }
        self.spec.verify_digest(diag)
    }

    // ------------------------------------------------------------------
    // environment distribution

    fn archive_format(&self, diag: &mut Diagnostics) -> String {
        match &self.config.archive_format {
            Some(format) => {
                diag.warning(format!(
                    "Overriding spec'ed and/or default archive file format to {format}; it may not automatically unpack correctly."
                ));
                format.clone()
            }
            None => self.spec.archive_format().to_string(),
        }
    }

    fn pack_env(&mut self, diag: &mut Diagnostics) -> bool {
        let archive = self.shelf.env_archive(&self.env_name(), &self.archive_format(diag));
        self.lifecycle().pack(&self.env_name(), &archive, diag)
    }

    fn unpack_env(&mut self, diag: &mut Diagnostics) -> bool {
        let archive = self.shelf.env_archive(&self.env_name(), &self.archive_format(diag));
        self.lifecycle().unpack(&self.env_name(), &archive, diag) && self.register_env(diag)
    }

    /// Register the kernel, injecting collected data variables when the
    /// spec carries a `data` output.
    fn register_env(&mut self, diag: &mut Diagnostics) -> bool {
        let env_vars = self.data_output(diag).map(|data| data.kernel_env()).unwrap_or_default();
        self.lifecycle()
            .register(&self.env_name(), self.spec.display_name(), &env_vars, diag)
    }

    fn delete_env(&mut self, diag: &mut Diagnostics) -> bool {
        let env_name = self.env_name();
        let lifecycle = self.lifecycle();
        let mut unregister = Diagnostics::new();
        if !lifecycle.unregister(&env_name, &mut unregister) {
            diag.warning(format!("Kernel {env_name} was not unregistered; continuing with delete."));
        }
        lifecycle.delete(&env_name, diag)
    }

    // ------------------------------------------------------------------
    // data and shelf

    fn data_output(&self, diag: &mut Diagnostics) -> Option<DataOutput> {
        self.spec.output_value(OutputKey::Data)?;
        match self.spec.output::<DataOutput>(OutputKey::Data) {
            Ok(data) => Some(data),
            Err(err) => {
                diag.warning(format!("Ignoring unreadable data output: {err:#}"));
                None
            }
        }
    }

    fn data_collect(&mut self, diag: &mut Diagnostics) -> bool {
        let Some(urls) = self.output_or_error::<Vec<String>>(OutputKey::NotebookRepoUrls, diag) else {
            return false;
        };
        let Some(collection) = RefdataCollection::from_repos(&self.config.repos_dir, &urls, diag) else {
            return diag.error("Refdata collection failed.");
        };
        let data = collection.to_output();
        self.record(OutputKey::Data, &data, diag) && self.persist(diag)
    }

    fn shelve_spec(&mut self, diag: &mut Diagnostics) -> bool {
        if let Err(err) = self.shelf.ensure() {
            return diag.exception("Failed to create shelf", &err);
        }
        let shelf_dir = self.shelf.path().to_path_buf();
        let add_digest = !self.config.ignore_spec_hash;
        if !self.spec.save_to(&shelf_dir, add_digest, diag) {
            return false;
        }
        if let Some(data) = self.data_output(diag) {
            if let Err(err) = self.shelf.save_exports(&data.exports()) {
                return diag.exception("Failed writing shelf exports", &err);
            }
        }
        tracing::info!(shelf = %self.shelf.name(), "spec added to pantry shelf");
        true
    }

    fn delete_repos(&mut self, diag: &mut Diagnostics) -> bool {
        let urls = self
            .spec
            .output::<Vec<String>>(OutputKey::NotebookRepoUrls)
            .unwrap_or_else(|_| self.spec.repository_urls());
        RepositorySet::new(self.config).delete_all(&urls, diag)
    }
}

/// Render gate verdicts as aligned text lines.
pub fn format_status(verdicts: &[Verdict]) -> String {
    let mut text = String::new();
    for verdict in verdicts {
        let cause = verdict
            .cause
            .as_ref()
            .map(|cause| cause.to_string())
            .unwrap_or_default();
        text.push_str(&format!("{:<20} {:<28} {cause}\n", verdict.stage.as_str(), verdict.state.as_str()));
    }
    text
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
