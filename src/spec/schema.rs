//! Typed view of each spec zone plus the closed keyword vocabularies.
//!
//! Vocabulary checks run against the raw YAML mapping first so every offending
//! key can be reported by name; the typed structs are only built once those
//! checks pass.
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub const HEADER_ALLOWED: [&str; 10] = [
    "image_name",
    "description",
    "valid_on",
    "expires_on",
    "python_version",
    "nb_repo",
    "nb_root_directory",
    "deployment_name",
    "kernel_name",
    "display_name",
];

pub const HEADER_REQUIRED: [&str; 6] = [
    "image_name",
    "deployment_name",
    "kernel_name",
    "python_version",
    "valid_on",
    "expires_on",
];

pub const SELECTION_ALLOWED: [&str; 5] = [
    "nb_repo",
    "nb_root_directory",
    "include_subdirs",
    "exclude_subdirs",
    "ref",
];

pub const SYSTEM_ALLOWED: [&str; 3] = ["spec_version", "spec_sha256", "archive_format"];

pub const SYSTEM_REQUIRED: [&str; 1] = ["spec_version"];

pub const TOP_LEVEL_ALLOWED: [&str; 6] = [
    "image_spec_header",
    "selected_notebooks",
    "extra_mamba_packages",
    "extra_pip_packages",
    "out",
    "system",
];

pub const TOP_LEVEL_REQUIRED: [&str; 3] = ["image_spec_header", "selected_notebooks", "system"];

/// Immutable identity of the target environment.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Header {
    pub image_name: String,
    pub deployment_name: String,
    pub kernel_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    pub python_version: String,
    #[serde(deserialize_with = "string_or_number")]
    pub valid_on: String,
    #[serde(deserialize_with = "string_or_number")]
    pub expires_on: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nb_repo: Option<String>,
    #[serde(default)]
    pub nb_root_directory: Option<String>,
}

/// One repository selection entry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Selection {
    #[serde(default)]
    pub nb_repo: Option<String>,
    #[serde(default)]
    pub nb_root_directory: Option<String>,
    #[serde(default)]
    pub include_subdirs: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_subdirs: Vec<String>,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
}

impl Selection {
    /// Include patterns, defaulting to "match everything".
    pub fn include_patterns(&self) -> Vec<String> {
        self.include_subdirs
            .clone()
            .unwrap_or_else(|| vec![".".to_string()])
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SystemBlock {
    #[serde(deserialize_with = "string_or_number")]
    pub spec_version: String,
    #[serde(default)]
    pub archive_format: Option<String>,
    #[serde(default)]
    pub spec_sha256: Option<String>,
}

/// The validated, typed input zones of a spec.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecDocument {
    pub header: Header,
    pub selections: Vec<Selection>,
    pub extra_mamba_packages: Vec<String>,
    pub extra_pip_packages: Vec<String>,
    pub system: SystemBlock,
}

/// Closed vocabulary of the output zone, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKey {
    NotebookRepoUrls,
    NotebookRepoHashes,
    TestNotebooks,
    TestImports,
    NbToImports,
    MambaSpec,
    PipRequirementFiles,
    PipMap,
    PipCompilerOutput,
    PackageVersions,
    EnvironmentPrefix,
    InstalledRequirements,
    TestResults,
    Data,
}

impl OutputKey {
    pub const ALL: [OutputKey; 14] = [
        OutputKey::NotebookRepoUrls,
        OutputKey::NotebookRepoHashes,
        OutputKey::TestNotebooks,
        OutputKey::TestImports,
        OutputKey::NbToImports,
        OutputKey::MambaSpec,
        OutputKey::PipRequirementFiles,
        OutputKey::PipMap,
        OutputKey::PipCompilerOutput,
        OutputKey::PackageVersions,
        OutputKey::EnvironmentPrefix,
        OutputKey::InstalledRequirements,
        OutputKey::TestResults,
        OutputKey::Data,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKey::NotebookRepoUrls => "notebook_repo_urls",
            OutputKey::NotebookRepoHashes => "notebook_repo_hashes",
            OutputKey::TestNotebooks => "test_notebooks",
            OutputKey::TestImports => "test_imports",
            OutputKey::NbToImports => "nb_to_imports",
            OutputKey::MambaSpec => "mamba_spec",
            OutputKey::PipRequirementFiles => "pip_requirement_files",
            OutputKey::PipMap => "pip_map",
            OutputKey::PipCompilerOutput => "pip_compiler_output",
            OutputKey::PackageVersions => "package_versions",
            OutputKey::EnvironmentPrefix => "environment_prefix",
            OutputKey::InstalledRequirements => "installed_requirements",
            OutputKey::TestResults => "test_results",
            OutputKey::Data => "data",
        }
    }

    pub fn parse(name: &str) -> Option<OutputKey> {
        OutputKey::ALL.into_iter().find(|key| key.as_str() == name)
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accept `3.11`, `"3.11"`, `1` or `2025-01-01` alike; YAML happily turns
/// version numbers into floats.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::String(text) => Ok(text),
        serde_yaml::Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, found {other:?}"
        ))),
    }
}
