//! CLI argument parsing for the curation pipeline.
//!
//! Arguments are converted once into an explicit [`Config`] plus a workflow
//! and [`StepSelection`]; nothing downstream reads the process arguments.
use crate::config::{
    Config, DirtyPolicy, RepoMode, DEFAULT_NOTEBOOK_TIMEOUT_SECS, DEFAULT_TEST_JOBS,
    VALID_ARCHIVE_FORMATS,
};
use crate::pipeline::{StepSelection, Workflow};
use anyhow::Result;
use clap::builder::PossibleValuesParser;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "nbenv",
    version,
    about = "Curate reproducible notebook environments from a declarative spec",
    after_help = "Examples:\n  nbenv roman-spec.yaml --curate\n  nbenv roman-spec.yaml --test\n  nbenv roman-spec.yaml --test-notebooks 'calibration,imaging'\n  nbenv https://example.org/specs/roman-spec.yaml --reinstall --test-imports\n  nbenv roman-spec.yaml --status"
)]
pub struct RootArgs {
    /// Spec location: path, file://, http(s):// or s3:// URI
    #[arg(value_name = "SPEC")]
    pub spec: String,

    /// Curation workflow: clone, compile, create and install, then save the spec
    #[arg(long, conflicts_with = "reinstall")]
    pub curate: bool,

    /// Reinstall workflow: rebuild the environment from a compiled spec
    #[arg(long)]
    pub reinstall: bool,

    /// Print the recompute state of every stage and exit
    #[arg(long)]
    pub status: bool,

    /// Re-run selected stages even when their outputs are valid
    #[arg(long)]
    pub force: bool,

    /// Clone or update the notebook repositories and rescan notebooks
    #[arg(long)]
    pub clone_repos: bool,

    /// Generate the base environment spec and compile pip requirements
    #[arg(long)]
    pub compile_packages: bool,

    /// Create the target environment and register its kernel
    #[arg(long)]
    pub init_env: bool,

    /// Install compiled pip requirements into the target environment
    #[arg(long)]
    pub install_packages: bool,

    /// Import every package the selected notebooks import
    #[arg(long)]
    pub test_imports: bool,

    /// Run notebooks matching comma-separated regexes (default .*)
    #[arg(long, value_name = "REGEX", num_args = 0..=1, default_missing_value = ".*")]
    pub test_notebooks: Option<String>,

    /// Test imports and every notebook
    #[arg(short = 't', long = "test-all", visible_alias = "test")]
    pub test_all: bool,

    /// Recompute and store the spec digest
    #[arg(long)]
    pub update_spec_hash: bool,

    /// Validate the spec and its digest without other actions
    #[arg(long)]
    pub validate_spec: bool,

    /// Archive the environment onto the pantry shelf
    #[arg(long)]
    pub pack_env: bool,

    /// Restore the environment from its shelf archive and register it
    #[arg(long)]
    pub unpack_env: bool,

    /// Register the environment as a Jupyter kernel
    #[arg(long)]
    pub register_env: bool,

    /// Remove the environment's Jupyter kernel
    #[arg(long)]
    pub unregister_env: bool,

    /// Copy the spec and data exports onto its pantry shelf
    #[arg(long)]
    pub shelve_spec: bool,

    /// Collect refdata_dependencies.yaml declarations from the repositories
    #[arg(long)]
    pub data_collect: bool,

    /// Delete the repository clones
    #[arg(long)]
    pub delete_repos: bool,

    /// Uninstall the compiled pip requirements
    #[arg(long)]
    pub uninstall_packages: bool,

    /// Unregister the kernel and delete the environment
    #[arg(long)]
    pub delete_env: bool,

    /// Remove package and installer caches
    #[arg(long)]
    pub compact: bool,

    /// Drop every output field and the digest
    #[arg(long)]
    pub reset_spec: bool,

    /// Parallel notebook test jobs
    #[arg(long, env = "NBENV_TEST_JOBS", default_value_t = DEFAULT_TEST_JOBS)]
    pub jobs: usize,

    /// Per-notebook timeout in seconds
    #[arg(long, value_name = "SECS", env = "NBENV_TEST_MAX_SECS", default_value_t = DEFAULT_NOTEBOOK_TIMEOUT_SECS)]
    pub timeout: u64,

    /// How existing clones are reconciled with their remotes
    #[arg(long, value_enum, default_value_t = RepoMode::Floating)]
    pub repo_mode: RepoMode,

    /// What to do with uncommitted changes in an existing clone
    #[arg(long, value_enum, default_value_t = DirtyPolicy::Fail)]
    pub dirty_policy: DirtyPolicy,

    /// Clone with --depth 1 when no explicit ref is requested
    #[arg(long)]
    pub shallow: bool,

    /// Override the spec's environment archive format
    #[arg(long, value_parser = PossibleValuesParser::new(VALID_ARCHIVE_FORMATS))]
    pub archive_format: Option<String>,

    /// Neither add nor verify the spec digest
    #[arg(long)]
    pub ignore_spec_hash: bool,

    /// Ask the resolver to record package hashes
    #[arg(long)]
    pub add_pip_hashes: bool,

    /// Extra pip requirement files merged with the notebook requirements
    #[arg(long, value_name = "FILE")]
    pub inject_requirements: Vec<PathBuf>,

    /// Live installation root (default $NBENV_ROOT or ~/.nbenv-live)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Directory holding the repository clones
    #[arg(long, value_name = "DIR")]
    pub repos_dir: Option<PathBuf>,

    /// Pantry directory holding shelves
    #[arg(long, value_name = "DIR")]
    pub pantry: Option<PathBuf>,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Log at debug level
    #[arg(long)]
    pub verbose: bool,

    /// Log at trace level and print full error chains
    #[arg(long)]
    pub debug: bool,
}

impl RootArgs {
    pub fn workflow(&self) -> Workflow {
        if self.curate {
            Workflow::Curation
        } else if self.reinstall {
            Workflow::Reinstall
        } else {
            Workflow::Explicit
        }
    }

    pub fn steps(&self) -> StepSelection {
        StepSelection {
            clone_repos: self.clone_repos,
            compile_packages: self.compile_packages,
            init_env: self.init_env,
            install_packages: self.install_packages,
            test_imports: self.test_imports || self.test_all,
            test_notebooks: if self.test_all {
                Some(".*".to_string())
            } else {
                self.test_notebooks.clone()
            },
            update_spec_hash: self.update_spec_hash,
            validate_spec: self.validate_spec,
            pack_env: self.pack_env,
            unpack_env: self.unpack_env,
            register_env: self.register_env,
            unregister_env: self.unregister_env,
            shelve_spec: self.shelve_spec,
            data_collect: self.data_collect,
            delete_repos: self.delete_repos,
            uninstall_packages: self.uninstall_packages,
            delete_env: self.delete_env,
            compact: self.compact,
            reset_spec: self.reset_spec,
        }
    }

    /// Default log directive derived from `--verbose` / `--debug`.
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "trace"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    pub fn to_config(&self) -> Result<Config> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => Config::default_root()?,
        };
        let mut config = Config::with_root(&root);
        config.apply_env_overrides();
        if let Some(repos_dir) = &self.repos_dir {
            config.repos_dir = repos_dir.clone();
        }
        if let Some(pantry) = &self.pantry {
            config.pantry_dir = pantry.clone();
        }
        config.jobs = self.jobs;
        config.timeouts.notebook = Duration::from_secs(self.timeout);
        config.repo_mode = self.repo_mode;
        config.dirty_policy = self.dirty_policy;
        config.shallow = self.shallow;
        config.archive_format = self.archive_format.clone();
        config.injected_requirements = self.inject_requirements.clone();
        config.ignore_spec_hash = self.ignore_spec_hash;
        config.add_pip_hashes = self.add_pip_hashes;
        config.force = self.force;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::RootArgs;
    use crate::config::RepoMode;
    use crate::pipeline::Workflow;
    use clap::Parser;
    use std::path::Path;
    use std::time::Duration;

    #[test]
    fn test_flag_selects_imports_and_all_notebooks() {
        let args = RootArgs::try_parse_from(["nbenv", "spec.yaml", "-t"]).expect("parse");
        let steps = args.steps();
        assert!(steps.test_imports);
        assert_eq!(steps.test_notebooks.as_deref(), Some(".*"));
        assert_eq!(args.workflow(), Workflow::Explicit);
    }

    #[test]
    fn bare_test_notebooks_defaults_to_everything() {
        let args = RootArgs::try_parse_from(["nbenv", "spec.yaml", "--test-notebooks"]).expect("parse");
        assert_eq!(args.steps().test_notebooks.as_deref(), Some(".*"));
        let args = RootArgs::try_parse_from(["nbenv", "spec.yaml", "--test-notebooks", "imaging"])
            .expect("parse");
        assert_eq!(args.steps().test_notebooks.as_deref(), Some("imaging"));
    }

    #[test]
    fn workflows_are_exclusive() {
        assert!(RootArgs::try_parse_from(["nbenv", "spec.yaml", "--curate", "--reinstall"]).is_err());
        let args = RootArgs::try_parse_from(["nbenv", "spec.yaml", "--reinstall"]).expect("parse");
        assert_eq!(args.workflow(), Workflow::Reinstall);
    }

    #[test]
    fn archive_formats_are_restricted() {
        assert!(RootArgs::try_parse_from(["nbenv", "spec.yaml", "--archive-format", ".zip"]).is_err());
        assert!(RootArgs::try_parse_from(["nbenv", "spec.yaml", "--archive-format", ".tar.zst"]).is_ok());
    }

    #[test]
    fn config_carries_cli_settings() {
        let args = RootArgs::try_parse_from([
            "nbenv",
            "spec.yaml",
            "--root",
            "/srv/nbenv",
            "--jobs",
            "3",
            "--timeout",
            "90",
            "--repo-mode",
            "locked",
            "--inject-requirements",
            "/srv/extra.txt",
        ])
        .expect("parse");
        let config = args.to_config().expect("config");
        assert_eq!(config.root, Path::new("/srv/nbenv"));
        assert_eq!(config.jobs, 3);
        assert_eq!(config.timeouts.notebook, Duration::from_secs(90));
        assert_eq!(config.repo_mode, RepoMode::Locked);
        assert_eq!(config.injected_requirements, vec![Path::new("/srv/extra.txt").to_path_buf()]);
    }
}
