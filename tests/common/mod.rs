//! Shared test infrastructure for integration tests.
//!
//! A fixture is a temp directory holding a local git "origin" with one
//! notebook repository, a spec pointing at it, and shell-script stand-ins for
//! the environment manager, installer and resolver.

use serde::Deserialize;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const NOTEBOOK: &str = r##"{
  "cells": [
    {"cell_type": "markdown", "source": ["# PSF fitting\n"]},
    {"cell_type": "code", "source": ["import numpy as np\n", "from astropy.io import fits\n", "%matplotlib inline\n"]}
  ],
  "metadata": {},
  "nbformat": 4,
  "nbformat_minor": 5
}
"##;

const MICROMAMBA: &str = r#"case "$1" in
  env)
    if [ "$2" = "list" ]; then
      printf '{"envs": ["%s"' "$MAMBA_ROOT_PREFIX"
      for env in "$MAMBA_ROOT_PREFIX"/envs/*; do
        [ -d "$env" ] && printf ', "%s"' "$env"
      done
      printf ']}\n'
    elif [ "$2" = "remove" ]; then
      rm -rf "$MAMBA_ROOT_PREFIX/envs/$5"
    fi
    ;;
  create)
    mkdir -p "$MAMBA_ROOT_PREFIX/envs/$4/bin"
    ;;
  run)
    printf '%s\n' "$*" >> "$(dirname "$0")/mamba-run.log"
    ;;
esac
exit 0
"#;

const RESOLVER: &str = r#"out="$3"
printf 'astropy==6.1.0\n    # via extra\nnumpy==2.1.0\n    # via notebooks\n' > "$out"
printf 'resolved\n' >> "$(dirname "$0")/resolver.log"
"#;

/// Run summary printed by `nbenv --json`.
#[derive(Debug, Deserialize)]
pub struct TestResult {
    pub workflow: String,
    pub success: bool,
    pub stages_run: Vec<String>,
    pub errors: usize,
}

/// Temp workspace with an origin repository, fake tools and a spec.
pub struct TestFixture {
    pub dir: TempDir,
    pub spec: PathBuf,
}

impl TestFixture {
    /// Build the fixture; returns `None` (and prints why) when `git` or a
    /// POSIX shell is unavailable.
    pub fn new() -> Option<Self> {
        for tool in ["git", "sh"] {
            if which::which(tool).is_err() {
                eprintln!("Skipping: {tool} not available");
                return None;
            }
        }
        let dir = TempDir::new().expect("tempdir");
        let origin = dir.path().join("origin/roman_notebooks");
        write_file(&origin.join("notebooks/psf/psf.ipynb"), NOTEBOOK);
        write_file(&origin.join("notebooks/psf/requirements.txt"), "numpy==2.1.0\n");
        write_file(
            &origin.join("refdata_dependencies.yaml"),
            "install_files:\n  crds:\n    version: 12.0.4\n    environment_variable: CRDS_PATH\n    install_path: ${HOME}/refdata\n    data_path: crds-cache\n    data_url:\n      - https://data.example.org/crds.tar.gz\n",
        );
        git(&origin, &["init", "--quiet"]);
        git(&origin, &["add", "."]);
        git(
            &origin,
            &[
                "-c",
                "user.name=Fixture",
                "-c",
                "user.email=fixture@example.org",
                "commit",
                "--quiet",
                "-m",
                "notebooks",
            ],
        );

        write_script(dir.path(), "micromamba", MICROMAMBA);
        write_script(dir.path(), "resolver", RESOLVER);

        let spec = dir.path().join("roman-spec.yaml");
        write_file(
            &spec,
            &format!(
                "\
# Roman calibration image
image_spec_header:
  image_name: Roman Research Nexus
  deployment_name: roman
  kernel_name: roman-cal
  display_name: Roman Calibration
  python_version: '3.11'
  valid_on: 2025-01-01
  expires_on: 2027-01-01
  nb_repo: {}

selected_notebooks:
  - nb_root_directory: notebooks

extra_pip_packages:
  - astropy

system:
  spec_version: 1.0
",
                origin.display()
            ),
        );
        Some(Self { dir, spec })
    }

    pub fn bin(&self, name: &str) -> PathBuf {
        self.dir.path().join("bin").join(name)
    }

    pub fn live_root(&self) -> PathBuf {
        self.dir.path().join("live")
    }

    /// Count of lines the fake resolver appended to its log.
    pub fn resolver_runs(&self) -> usize {
        fs::read_to_string(self.bin("resolver.log"))
            .map(|text| text.lines().count())
            .unwrap_or(0)
    }

    /// Run `nbenv <spec> --json <args>` and parse the summary.
    pub fn run(&self, args: &[&str]) -> anyhow::Result<TestResult> {
        let output = self.run_raw(args)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(&stdout).map_err(|err| {
            anyhow::anyhow!(
                "unparseable summary ({err}): {stdout}\nstderr: {}",
                String::from_utf8_lossy(&output.stderr)
            )
        })
    }

    /// Run `nbenv <spec> --json <args>` and return the raw process output,
    /// for runs that stop before printing a summary.
    pub fn run_raw(&self, args: &[&str]) -> anyhow::Result<Output> {
        let output = Command::new(env!("CARGO_BIN_EXE_nbenv"))
            .arg(&self.spec)
            .arg("--json")
            .arg("--root")
            .arg(self.live_root())
            .arg("--pantry")
            .arg(self.dir.path().join("pantry"))
            .args(args)
            .env("NBENV_MAMBA_CMD", self.bin("micromamba"))
            .env("NBENV_RESOLVER_CMD", self.bin("resolver"))
            .env("NBENV_PIP_CMD", "pip")
            .env_remove("RUST_LOG")
            .output()?;
        Ok(output)
    }

    /// Run `nbenv <spec> --status --json` and return the raw verdicts.
    pub fn status(&self) -> anyhow::Result<serde_json::Value> {
        let output = Command::new(env!("CARGO_BIN_EXE_nbenv"))
            .arg(&self.spec)
            .args(["--status", "--json", "--root"])
            .arg(self.live_root())
            .output()?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

fn write_file(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    fs::write(path, contents).expect("write file");
}

fn write_script(root: &Path, name: &str, body: &str) {
    let path = root.join("bin").join(name);
    write_file(&path, &format!("#!/bin/sh\n{body}"));
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
}

fn git(cwd: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}
