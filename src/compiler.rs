//! Merge package declarations and pin them through the external resolver.
//!
//! Sources are plain requirement files, each tagged with where it came from.
//! Exact pins that disagree across sources are reported before the resolver
//! runs so the curator sees both offending files instead of a resolver trace.
use crate::config::{Config, TARGET_PACKAGES};
use crate::process::{self, CommandSpec};
use crate::util::write_text;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

pub const REQUIREMENTS_FILE: &str = "requirements.txt";

fn requirement_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._\-]*)\s*(?:\[[^\]]*\])?\s*(===|==|~=|!=|<=|>=|<|>|=)?\s*([^\s,;]*)")
            .expect("regex for requirement lines")
    })
}

/// Where a constraint was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// A `requirements.txt` next to a selected notebook.
    Notebook,
    /// A package list supplied from outside the spec.
    Injected,
    /// `extra_pip_packages` / `extra_mamba_packages` in the spec.
    Extra,
    /// The fixed base-environment package set.
    Base,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Notebook => "notebook",
            Provenance::Injected => "injected",
            Provenance::Extra => "extra",
            Provenance::Base => "base",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requirement file fed to the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequirementSource {
    pub path: PathBuf,
    pub provenance: Provenance,
}

impl RequirementSource {
    pub fn new(path: impl Into<PathBuf>, provenance: Provenance) -> Self {
        Self {
            path: path.into(),
            provenance,
        }
    }
}

/// One declared requirement line with its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Constraint {
    pub requirement: String,
    pub name: String,
    pub pin: Option<String>,
    pub source: String,
    pub provenance: Provenance,
}

impl Constraint {
    pub fn parse(requirement: &str, source: &str, provenance: Provenance) -> Self {
        let (name, pin) = match requirement_re().captures(requirement) {
            Some(caps) => {
                let name = normalize_name(caps.get(1).map(|m| m.as_str()).unwrap_or_default());
                let op = caps.get(2).map(|m| m.as_str());
                let version = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
                let exact = matches!(op, Some("==") | Some("===")) && !version.contains('*');
                let pin = (exact && !version.is_empty()).then(|| version.to_string());
                (name, pin)
            }
            None => (normalize_name(requirement), None),
        };
        Self {
            requirement: requirement.to_string(),
            name,
            pin,
            source: source.to_string(),
            provenance,
        }
    }
}

/// Two sources demanding different exact versions of one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinConflict {
    pub package: String,
    pub first: Constraint,
    pub second: Constraint,
}

impl fmt::Display for PinConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Conflicting pins for '{}': '{}' from {} ({}) vs '{}' from {} ({})",
            self.package,
            self.first.requirement,
            self.first.source,
            self.first.provenance,
            self.second.requirement,
            self.second.source,
            self.second.provenance,
        )
    }
}

/// Merged declarations plus the resolver's pinned output.
#[derive(Debug, Clone, Serialize)]
pub struct PackageManifest {
    pub constraints: Vec<Constraint>,
    pub pinned: Vec<String>,
    pub output_file: PathBuf,
    /// Raw resolver output, including its `# via` annotations.
    pub compiler_output: String,
}

impl PackageManifest {
    /// Requirement file path to its package lines.
    pub fn source_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for constraint in &self.constraints {
            map.entry(constraint.source.clone())
                .or_default()
                .push(constraint.requirement.clone());
        }
        map
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{} conflicting exact pins across requirement sources", .0.len())]
    Conflicts(Vec<PinConflict>),
    #[error("dependency resolver failed ({reason})")]
    Resolver {
        reason: String,
        stdout: String,
        stderr: String,
        listing: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Canonical package name: lowercase, runs of `-_.` folded to `-`.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut last_dash = false;
    for ch in name.trim().chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !last_dash {
                normalized.push('-');
            }
            last_dash = true;
        } else {
            normalized.push(ch.to_ascii_lowercase());
            last_dash = false;
        }
    }
    normalized
}

/// Package lines of a requirement file, sorted; blank, comment and `--hash`
/// continuation lines are dropped. Works on inputs and resolver output alike.
pub fn read_package_lines(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(package_lines(&text))
}

pub fn package_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("--hash"))
        .map(|line| line.trim_end_matches('\\').trim_end().to_string())
        .collect();
    lines.sort();
    lines
}

/// Exact pins that disagree, each naming both sources. Deterministic: the
/// first declaration (in source order) is reported against each later one.
pub fn detect_conflicts(constraints: &[Constraint]) -> Vec<PinConflict> {
    let mut first_pin: BTreeMap<&str, &Constraint> = BTreeMap::new();
    let mut conflicts = Vec::new();
    for constraint in constraints {
        let Some(pin) = constraint.pin.as_deref() else {
            continue;
        };
        match first_pin.get(constraint.name.as_str()) {
            Some(first) if first.pin.as_deref() != Some(pin) => conflicts.push(PinConflict {
                package: constraint.name.clone(),
                first: (*first).clone(),
                second: constraint.clone(),
            }),
            Some(_) => {}
            None => {
                first_pin.insert(constraint.name.as_str(), constraint);
            }
        }
    }
    conflicts
}

/// Input listing that correlates each requirement with the file declaring it.
pub fn annotated_listing(sources: &[RequirementSource]) -> String {
    let mut rows: Vec<(String, String)> = Vec::new();
    for source in sources {
        let path = source.path.display().to_string();
        match read_package_lines(&source.path) {
            Ok(lines) => rows.extend(lines.into_iter().map(|pkg| (pkg, path.clone()))),
            Err(err) => rows.push((format!("<unreadable: {err}>"), path)),
        }
    }
    rows.sort();
    rows.iter()
        .map(|(pkg, path)| format!("{pkg:<20}  : {path:<55}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line per package, newline terminated.
pub fn write_requirements_file(path: &Path, packages: &[String]) -> Result<()> {
    let mut text = String::new();
    for package in packages {
        text.push_str(package);
        text.push('\n');
    }
    write_text(path, &text)?;
    tracing::debug!(path = %path.display(), count = packages.len(), "wrote requirements file");
    Ok(())
}

#[derive(Debug, Serialize)]
struct BaseEnvironment<'a> {
    name: &'a str,
    channels: Vec<&'a str>,
    dependencies: Vec<String>,
}

/// Definition of the empty base environment: python, the fixed target
/// packages, and any extras, sorted and deduplicated.
pub fn generate_base_environment(
    kernel_name: &str,
    python_version: &str,
    extra_packages: &[String],
) -> Result<String> {
    let python = if python_version.is_empty() {
        "python".to_string()
    } else {
        format!("python={python_version}")
    };
    let dependencies: BTreeSet<String> = std::iter::once(python)
        .chain(TARGET_PACKAGES.iter().map(|pkg| pkg.to_string()))
        .chain(extra_packages.iter().cloned())
        .collect();
    let environment = BaseEnvironment {
        name: kernel_name,
        channels: vec!["conda-forge"],
        dependencies: dependencies.into_iter().collect(),
    };
    serde_yaml::to_string(&environment).context("serialize base environment")
}

pub struct DependencyCompiler<'a> {
    config: &'a Config,
}

impl<'a> DependencyCompiler<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// `requirements.txt` files that exist beside the given notebooks, one
    /// per unique directory.
    pub fn find_requirement_files(&self, notebooks: &[String]) -> Vec<PathBuf> {
        let dirs: BTreeSet<&Path> = notebooks
            .iter()
            .filter_map(|notebook| Path::new(notebook).parent())
            .collect();
        let files: Vec<PathBuf> = dirs
            .into_iter()
            .map(|dir| dir.join(REQUIREMENTS_FILE))
            .filter(|path| path.is_file())
            .inspect(|path| tracing::debug!(path = %path.display(), "found requirements file"))
            .collect();
        tracing::info!(count = files.len(), "found notebook requirements files");
        files
    }

    /// Read every source, reject conflicting pins, run the resolver once over
    /// the union and return the pinned manifest.
    ///
    /// `base` constraints take part in conflict detection only; they belong to
    /// the base environment and are never handed to the pip resolver.
    pub fn merge_and_compile(
        &self,
        sources: &[RequirementSource],
        base: &[Constraint],
        python_version: &str,
        output: &Path,
    ) -> Result<PackageManifest, CompileError> {
        let mut constraints: Vec<Constraint> = base.to_vec();
        for source in sources {
            let label = source.path.display().to_string();
            let lines = read_package_lines(&source.path)?;
            constraints.extend(
                lines
                    .iter()
                    .map(|line| Constraint::parse(line, &label, source.provenance)),
            );
        }

        let conflicts = detect_conflicts(&constraints);
        if !conflicts.is_empty() {
            return Err(CompileError::Conflicts(conflicts));
        }
        let constraints: Vec<Constraint> = constraints
            .into_iter()
            .filter(|constraint| constraint.provenance != Provenance::Base)
            .collect();

        if sources.is_empty() {
            tracing::warn!("no requirement sources to compile");
            write_text(output, "")?;
            return Ok(PackageManifest {
                constraints,
                pinned: Vec::new(),
                output_file: output.to_path_buf(),
                compiler_output: String::new(),
            });
        }

        tracing::info!(
            sources = sources.len(),
            constraints = constraints.len(),
            hashes = self.config.add_pip_hashes,
            "compiling combined pip requirements"
        );
        let spec = self.resolver_command(sources, python_version, output)?;
        let outcome = process::run(&spec)?;
        if !outcome.success() {
            return Err(CompileError::Resolver {
                reason: outcome.failure_reason(),
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                listing: annotated_listing(sources),
            });
        }

        let compiler_output = fs::read_to_string(output)
            .with_context(|| format!("read resolver output {}", output.display()))?;
        let mut pinned = package_lines(&compiler_output);
        pinned.dedup();
        tracing::info!(
            pinned = pinned.len(),
            elapsed_ms = outcome.duration_ms,
            "compiled pip requirements"
        );
        Ok(PackageManifest {
            constraints,
            pinned,
            output_file: output.to_path_buf(),
            compiler_output,
        })
    }

    fn resolver_command(
        &self,
        sources: &[RequirementSource],
        python_version: &str,
        output: &Path,
    ) -> Result<CommandSpec> {
        let mut args = vec![
            "--quiet".to_string(),
            "--output-file".to_string(),
            output.display().to_string(),
            "--python-version".to_string(),
            python_version.to_string(),
            "--universal".to_string(),
        ];
        if self.config.add_pip_hashes {
            args.push("--generate-hashes".to_string());
        }
        args.push("--no-header".to_string());
        args.push("--annotate".to_string());
        args.extend(sources.iter().map(|source| source.path.display().to_string()));

        let mut spec = CommandSpec::tool(&self.config.tools.resolver, &args, self.config.timeouts.compile)?;
        for (key, value) in self.config.tool_env() {
            spec = spec.env(&key, &value);
        }
        Ok(spec)
    }
}

#[cfg(test)]
#[path = "compiler_tests.rs"]
mod tests;
