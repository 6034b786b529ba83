//! Supporting-data declarations carried by notebook repositories.
//!
//! Each repository may ship a `refdata_dependencies.yaml` at its root naming
//! data packages (version, environment variable, install location, source
//! URLs) plus plain environment variables. Files from every repository are
//! validated, checked against each other for conflicting variable values, and
//! merged into the `data` output.
use crate::diagnostics::Diagnostics;
use crate::util::repo_basename;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

pub const REFDATA_FILE: &str = "refdata_dependencies.yaml";

const MAX_ENV_VALUE_LEN: usize = 131_072;

fn env_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").expect("regex for env var names"))
}

fn path_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.][A-Za-z0-9_.\-]*$").expect("regex for path parts"))
}

fn path_root_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\$([A-Za-z_][A-Za-z0-9_]*)|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|[A-Za-z0-9_.][A-Za-z0-9_.\-]*)$")
            .expect("regex for path roots")
    })
}

/// One named data package.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DataSection {
    pub version: serde_yaml::Value,
    pub environment_variable: String,
    pub install_path: String,
    pub data_path: String,
    #[serde(default)]
    pub data_url: Vec<String>,
}

impl DataSection {
    /// `install_path` joined with `data_path`, still unresolved.
    pub fn abstract_path(&self) -> String {
        let install = self.install_path.trim_end_matches('/');
        let data = self.data_path.trim_matches('/');
        if data.is_empty() {
            install.to_string()
        } else {
            format!("{install}/{data}")
        }
    }

    fn validate(&self, file: &str, name: &str, diag: &mut Diagnostics) -> bool {
        let mut ok = true;
        if !matches!(self.version, serde_yaml::Value::String(_) | serde_yaml::Value::Number(_)) {
            ok = diag.error(format!(
                "Invalid version for refdata file '{file}' section '{name}'. Should be a string."
            ));
        }
        if !is_valid_env_name(&self.environment_variable) {
            ok = diag.error(format!(
                "Invalid env var name '{}' in refdata file '{file}' section '{name}'.",
                self.environment_variable
            ));
        }
        if !is_valid_abstract_path(&self.install_path) {
            ok = diag.error(format!(
                "Invalid data install path '{}' for refdata file '{file}' section '{name}'.",
                self.install_path
            ));
        }
        if !self.data_path.is_empty() && !is_valid_relative_path(&self.data_path) {
            ok = diag.error(format!(
                "Invalid data path '{}' for refdata file '{file}' section '{name}'.",
                self.data_path
            ));
        }
        for url in &self.data_url {
            if !is_valid_data_url(url) {
                ok = diag.error(format!(
                    "Found invalid data URL '{url}' in refdata file '{file}' section '{name}'."
                ));
            }
        }
        ok
    }
}

/// Contents of one `refdata_dependencies.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RefdataSpec {
    #[serde(default)]
    pub install_files: BTreeMap<String, DataSection>,
    #[serde(default)]
    pub other_variables: BTreeMap<String, String>,
}

impl RefdataSpec {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let spec: Option<Self> = serde_yaml::from_str(text).context("parse refdata spec")?;
        Ok(spec.unwrap_or_default())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("load {}", path.display()))
    }

    pub fn validate(&self, file: &str, diag: &mut Diagnostics) -> bool {
        tracing::debug!(file, "validating refdata sections");
        let mut ok = true;
        for (name, section) in &self.install_files {
            ok &= section.validate(file, name, diag);
        }
        for (name, value) in &self.other_variables {
            if !is_valid_env_name(name) {
                ok = diag.error(format!("Invalid environment name: '{name}' in refdata file '{file}'."));
            }
            if value.len() > MAX_ENV_VALUE_LEN {
                ok = diag.error(format!(
                    "Invalid environment value for '{name}' in refdata file '{file}': longer than {MAX_ENV_VALUE_LEN} bytes."
                ));
            }
        }
        ok
    }

    /// Every variable this file defines: data-section variables map to their
    /// abstract path, plain variables to their value.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars: BTreeMap<String, String> = self
            .install_files
            .values()
            .map(|section| (section.environment_variable.clone(), section.abstract_path()))
            .collect();
        vars.extend(self.other_variables.clone());
        vars
    }
}

/// The merged `data` output.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DataOutput {
    pub spec_inputs: BTreeMap<String, RefdataSpec>,
    pub urls: Vec<(String, String)>,
    pub section_variables: BTreeMap<String, String>,
    pub other_variables: BTreeMap<String, String>,
}

impl DataOutput {
    /// Variables to inject into the kernel, with leading `$VAR` / `${VAR}`
    /// path roots expanded from the current environment where set.
    pub fn kernel_env(&self) -> BTreeMap<String, String> {
        self.section_variables
            .iter()
            .chain(&self.other_variables)
            .map(|(name, value)| (name.clone(), resolve_path(value)))
            .collect()
    }

    /// `export NAME=value` lines for a shell.
    pub fn exports(&self) -> String {
        let mut text = String::new();
        for (name, value) in self.section_variables.iter().chain(&self.other_variables) {
            text.push_str(&format!("export {name}={}\n", shell_words::quote(value)));
        }
        text
    }
}

/// All refdata files found across a set of repositories.
#[derive(Debug, Default)]
pub struct RefdataCollection {
    specs: BTreeMap<String, RefdataSpec>,
}

impl RefdataCollection {
    /// Load the refdata file at the root of each repository clone. A
    /// repository without one contributes nothing.
    pub fn from_repos(repos_dir: &Path, urls: &[String], diag: &mut Diagnostics) -> Option<Self> {
        let mut specs = BTreeMap::new();
        let mut ok = true;
        for url in urls {
            let path = repos_dir.join(repo_basename(url)).join(REFDATA_FILE);
            if !path.is_file() {
                tracing::debug!(url = %url, "no refdata file in repository");
                continue;
            }
            let label = path.display().to_string();
            match RefdataSpec::load(&path) {
                Ok(spec) => {
                    ok &= spec.validate(&label, diag);
                    specs.insert(label, spec);
                }
                Err(err) => {
                    ok = diag.exception(&format!("Failed loading refdata file {label}"), &err);
                }
            }
        }
        let collection = Self::from_specs(specs);
        ok &= collection.check_conflicts(diag);
        tracing::info!(files = collection.specs.len(), ok, "collected refdata specs");
        ok.then_some(collection)
    }

    pub fn from_specs(specs: BTreeMap<String, RefdataSpec>) -> Self {
        Self { specs }
    }

    /// No variable may be given two different values by two files.
    pub fn check_conflicts(&self, diag: &mut Diagnostics) -> bool {
        let mut seen: BTreeMap<String, (String, String)> = BTreeMap::new();
        let mut ok = true;
        for (file, spec) in &self.specs {
            for (name, value) in spec.variables() {
                match seen.get(&name) {
                    Some((first_file, first_value)) if *first_value != value => {
                        ok = diag.error(format!(
                            "Conflicting environment variable values for env var '{name}' in refdata specs '{first_file}' and '{file}'."
                        ));
                    }
                    Some(_) => {}
                    None => {
                        seen.insert(name, (file.clone(), value));
                    }
                }
            }
        }
        ok
    }

    pub fn to_output(&self) -> DataOutput {
        let mut output = DataOutput {
            spec_inputs: self.specs.clone(),
            ..DataOutput::default()
        };
        for spec in self.specs.values() {
            for (name, section) in &spec.install_files {
                output
                    .urls
                    .extend(section.data_url.iter().map(|url| (name.clone(), url.clone())));
                output
                    .section_variables
                    .insert(section.environment_variable.clone(), section.abstract_path());
            }
            output.other_variables.extend(spec.other_variables.clone());
        }
        output
    }
}

pub fn is_valid_env_name(name: &str) -> bool {
    env_name_re().is_match(name)
}

/// Relative path whose first component may be `$VAR` or `${VAR}` and whose
/// components never climb with `..`.
pub fn is_valid_abstract_path(path: &str) -> bool {
    if path.starts_with('/') {
        return false;
    }
    let mut parts = path.split('/').filter(|part| !part.is_empty());
    let Some(first) = parts.next() else {
        return false;
    };
    first != ".." && path_root_re().is_match(first) && parts.all(valid_part)
}

fn is_valid_relative_path(path: &str) -> bool {
    !path.starts_with('/') && path.split('/').filter(|part| !part.is_empty()).all(valid_part)
}

fn valid_part(part: &str) -> bool {
    part != ".." && path_part_re().is_match(part)
}

/// A data URL needs both a scheme and a host.
pub fn is_valid_data_url(url: &str) -> bool {
    url::Url::parse(url.trim()).is_ok_and(|url| url.host_str().is_some_and(|host| !host.is_empty()))
}

/// Expand a leading `$VAR` / `${VAR}` component from the process
/// environment; unknown variables are left as written.
pub fn resolve_path(path: &str) -> String {
    let (first, rest) = match path.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (path, None),
    };
    let Some(caps) = path_root_re().captures(first) else {
        return path.to_string();
    };
    let Some(name) = caps.get(1).or_else(|| caps.get(2)) else {
        return path.to_string();
    };
    match std::env::var(name.as_str()) {
        Ok(value) => match rest {
            Some(rest) => format!("{}/{rest}", value.trim_end_matches('/')),
            None => value,
        },
        Err(_) => path.to_string(),
    }
}

#[cfg(test)]
#[path = "refdata_tests.rs"]
mod tests;
