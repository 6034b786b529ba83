//! The spec document: load, validate, record outputs, persist.
//!
//! A `SpecStore` owns the source text of one spec file. Input zones are parsed
//! into typed structs once `validate` succeeds; the output zone is held as a
//! key-ordered map and written back by replacing only the `out:` block, so
//! curator comments and formatting survive every save.
mod document;
mod location;
mod schema;

pub use location::resolve_spec_location;
pub use schema::{Header, OutputKey, Selection, SpecDocument, SystemBlock};

use crate::config::{DEFAULT_ARCHIVE_FORMAT, VALID_ARCHIVE_FORMATS};
use crate::diagnostics::Diagnostics;
use crate::util::{sha256_hex, write_text};
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures that prevent a spec from being loaded at all.
#[derive(Debug, Error)]
pub enum SpecLoadError {
    #[error("read spec {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse spec {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("spec {} must be a mapping at the top level", path.display())]
    NotMapping { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct SpecStore {
    source: PathBuf,
    text: String,
    raw: Mapping,
    outputs: BTreeMap<OutputKey, Value>,
    unknown_outputs: Vec<String>,
    digest: Option<String>,
    parsed: Option<SpecDocument>,
}

impl SpecStore {
    pub fn load(path: &Path) -> Result<Self, SpecLoadError> {
        let text = fs::read_to_string(path).map_err(|source| SpecLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::from_text(path, &text)?;
        tracing::debug!(path = %path.display(), "loaded spec");
        Ok(store)
    }

    /// Parse `text` as though it had been read from `path`.
    pub fn from_text(path: &Path, text: &str) -> Result<Self, SpecLoadError> {
        let value: Value = serde_yaml::from_str(text).map_err(|source| SpecLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let Value::Mapping(raw) = value else {
            return Err(SpecLoadError::NotMapping {
                path: path.to_path_buf(),
            });
        };

        let mut outputs = BTreeMap::new();
        let mut unknown_outputs = Vec::new();
        if let Some(Value::Mapping(out)) = raw.get("out") {
            for (key, value) in out {
                let name = key.as_str().unwrap_or_default();
                match OutputKey::parse(name) {
                    Some(key) => {
                        outputs.insert(key, value.clone());
                    }
                    None => unknown_outputs.push(key_name(key)),
                }
            }
        }
        let digest = raw
            .get("system")
            .and_then(|system| system.get("spec_sha256"))
            .and_then(Value::as_str)
            .filter(|digest| !digest.is_empty())
            .map(str::to_string);

        Ok(Self {
            source: path.to_path_buf(),
            text: text.to_string(),
            raw,
            outputs,
            unknown_outputs,
            digest,
            parsed: None,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn is_validated(&self) -> bool {
        self.parsed.is_some()
    }

    // ------------------------------------------------------------------
    // validation

    /// Check every zone against its vocabulary and build the typed view.
    ///
    /// All violations are recorded before returning so a curator sees the
    /// whole list in one pass.
    pub fn validate(&mut self, diag: &mut Diagnostics) -> bool {
        self.parsed = None;
        let mut ok = true;

        for key in schema::TOP_LEVEL_REQUIRED {
            if !self.raw.contains_key(key) {
                ok = diag.error(format!("Missing required field: {key}"));
            }
        }
        for key in self.raw.keys() {
            let name = key.as_str().unwrap_or_default();
            if !schema::TOP_LEVEL_ALLOWED.contains(&name) {
                ok = diag.error(format!("Unknown top-level keyword: {}", key_name(key)));
            }
        }
        if !ok {
            return false;
        }

        ok &= check_zone(
            &self.raw,
            "image_spec_header",
            &schema::HEADER_ALLOWED,
            &schema::HEADER_REQUIRED,
            diag,
        );
        ok &= check_zone(
            &self.raw,
            "system",
            &schema::SYSTEM_ALLOWED,
            &schema::SYSTEM_REQUIRED,
            diag,
        );
        ok &= self.check_selections(diag);
        for name in &self.unknown_outputs {
            ok = diag.error(format!("Unknown keyword '{name}' in section 'out'."));
        }
        if !ok {
            return diag.error("Spec validation failed.");
        }

        let document = match self.build_document() {
            Ok(document) => document,
            Err(err) => return diag.exception("Spec validation failed", &err),
        };
        ok &= check_header_values(&document.header, diag);
        ok &= check_selection_values(&document, diag);
        ok &= check_package_lists(&document, diag);
        let archive_format = document
            .system
            .archive_format
            .as_deref()
            .unwrap_or(DEFAULT_ARCHIVE_FORMAT);
        if !VALID_ARCHIVE_FORMATS.contains(&archive_format) {
            diag.warning(format!(
                "Invalid .system.archive_format '{archive_format}'. Possibly unsupported if not one of: {}",
                VALID_ARCHIVE_FORMATS.join(" ")
            ));
        }
        if let Some(digest) = &self.digest {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                diag.warning(format!("System spec_sha256 hash '{digest}' is malformed."));
            }
        }
        if !ok {
            return diag.error("Spec validation failed.");
        }

        self.parsed = Some(document);
        tracing::debug!(path = %self.source.display(), "spec validated");
        true
    }

    fn check_selections(&self, diag: &mut Diagnostics) -> bool {
        let Some(Value::Sequence(entries)) = self.raw.get("selected_notebooks") else {
            return diag.error("Section 'selected_notebooks' must be a list.");
        };
        let mut ok = true;
        for (idx, entry) in entries.iter().enumerate() {
            let Value::Mapping(entry) = entry else {
                ok = diag.error(format!("selected_notebooks[{idx}] must be a mapping."));
                continue;
            };
            for key in entry.keys() {
                let name = key.as_str().unwrap_or_default();
                if !schema::SELECTION_ALLOWED.contains(&name) {
                    ok = diag.error(format!(
                        "Unknown keyword '{}' in selected_notebooks[{idx}].",
                        key_name(key)
                    ));
                }
            }
        }
        ok
    }

    fn build_document(&self) -> Result<SpecDocument> {
        let header: Header = zone(&self.raw, "image_spec_header")?;
        let selections: Vec<Selection> = zone(&self.raw, "selected_notebooks")?;
        let system: SystemBlock = zone(&self.raw, "system")?;
        let extra_mamba_packages: Vec<String> = optional_zone(&self.raw, "extra_mamba_packages")?;
        let extra_pip_packages: Vec<String> = optional_zone(&self.raw, "extra_pip_packages")?;
        Ok(SpecDocument {
            header,
            selections,
            extra_mamba_packages,
            extra_pip_packages,
            system,
        })
    }

    // ------------------------------------------------------------------
    // typed access; only legal after a successful `validate`

    fn document(&self) -> &SpecDocument {
        match &self.parsed {
            Some(document) => document,
            None => panic!(
                "spec {} accessed before validation",
                self.source.display()
            ),
        }
    }

    pub fn header(&self) -> &Header {
        &self.document().header
    }

    pub fn selections(&self) -> &[Selection] {
        &self.document().selections
    }

    pub fn extra_mamba_packages(&self) -> &[String] {
        &self.document().extra_mamba_packages
    }

    pub fn extra_pip_packages(&self) -> &[String] {
        &self.document().extra_pip_packages
    }

    pub fn kernel_name(&self) -> &str {
        &self.header().kernel_name
    }

    pub fn display_name(&self) -> &str {
        self.header()
            .display_name
            .as_deref()
            .unwrap_or(&self.header().kernel_name)
    }

    pub fn python_version(&self) -> &str {
        &self.header().python_version
    }

    /// Filesystem-safe identity used to name generated artifacts.
    pub fn moniker(&self) -> String {
        let header = self.header();
        format!(
            "{}-{}",
            header.image_name.replace(' ', "-").to_lowercase(),
            header.kernel_name
        )
    }

    pub fn archive_format(&self) -> &str {
        self.document()
            .system
            .archive_format
            .as_deref()
            .unwrap_or(DEFAULT_ARCHIVE_FORMAT)
    }

    /// Repository of a selection entry, falling back to the header default.
    pub fn selection_repo<'a>(&'a self, selection: &'a Selection) -> &'a str {
        selection
            .nb_repo
            .as_deref()
            .or(self.header().nb_repo.as_deref())
            .unwrap_or_default()
    }

    /// Root directory of a selection entry, falling back to the header default.
    pub fn selection_root<'a>(&'a self, selection: &'a Selection) -> &'a str {
        selection
            .nb_root_directory
            .as_deref()
            .or(self.header().nb_root_directory.as_deref())
            .unwrap_or_default()
    }

    /// Sorted, unique repository URLs named by the selection zone.
    pub fn repository_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .selections()
            .iter()
            .map(|selection| self.selection_repo(selection).to_string())
            .collect();
        urls.sort();
        urls.dedup();
        urls
    }

    /// Explicit refs requested per repository URL.
    pub fn repository_refs(&self) -> BTreeMap<String, String> {
        self.selections()
            .iter()
            .filter_map(|selection| {
                selection
                    .git_ref
                    .as_ref()
                    .map(|git_ref| (self.selection_repo(selection).to_string(), git_ref.clone()))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // output zone

    pub fn outputs_exist(&self, keys: &[OutputKey]) -> bool {
        keys.iter().all(|key| self.outputs.contains_key(key))
    }

    pub fn output_value(&self, key: OutputKey) -> Option<&Value> {
        self.outputs.get(&key)
    }

    /// Fetch previously recorded outputs; any absent key is an error.
    pub fn get_outputs(&self, keys: &[OutputKey]) -> Result<Vec<&Value>> {
        keys.iter()
            .map(|key| {
                self.outputs.get(key).ok_or_else(|| {
                    anyhow!("Missing output field '{key}' needs to be computed earlier or already in the spec.")
                })
            })
            .collect()
    }

    /// Typed fetch of one recorded output.
    pub fn output<T: DeserializeOwned>(&self, key: OutputKey) -> Result<T> {
        let value = self.get_outputs(&[key])?.remove(0).clone();
        serde_yaml::from_value(value).with_context(|| format!("decode output field '{key}'"))
    }

    pub fn set_output<T: Serialize>(&mut self, key: OutputKey, value: &T) -> Result<()> {
        let value =
            serde_yaml::to_value(value).with_context(|| format!("encode output field '{key}'"))?;
        tracing::debug!(key = key.as_str(), "set output");
        self.outputs.insert(key, value);
        Ok(())
    }

    pub fn remove_output(&mut self, key: OutputKey) {
        self.outputs.remove(&key);
    }

    /// Merge `fields` into the output zone and persist to the source file.
    pub fn revise_and_save(
        &mut self,
        fields: Vec<(OutputKey, Value)>,
        add_digest: bool,
        diag: &mut Diagnostics,
    ) -> bool {
        tracing::info!(path = %self.source.display(), fields = fields.len(), "revising spec");
        for (key, value) in fields {
            self.outputs.insert(key, value);
        }
        let source = self.source.clone();
        self.save_as(&source, add_digest, diag)
    }

    /// Drop the output zone and digest, re-validate, and persist.
    pub fn reset(&mut self, diag: &mut Diagnostics) -> bool {
        tracing::info!(path = %self.source.display(), "resetting spec outputs");
        self.outputs.clear();
        self.unknown_outputs.clear();
        self.digest = None;
        self.raw.remove("out");
        if !self.validate(diag) {
            return diag.error("Spec did not validate following reset.");
        }
        let source = self.source.clone();
        self.save_as(&source, false, diag)
    }

    // ------------------------------------------------------------------
    // persistence

    /// Copy of the spec under `dir`, keeping the source file name.
    pub fn save_to(&mut self, dir: &Path, add_digest: bool, diag: &mut Diagnostics) -> bool {
        let name = self
            .source
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "spec.yaml".into());
        self.save_as(&dir.join(name), add_digest, diag)
    }

    /// Write the spec to `path`. With `add_digest` the digest is recomputed;
    /// otherwise any previous digest is dropped since it no longer holds.
    pub fn save_as(&mut self, path: &Path, add_digest: bool, diag: &mut Diagnostics) -> bool {
        let result = if add_digest {
            self.compute_digest().map(|digest| {
                self.digest = Some(digest);
            })
        } else {
            self.digest = None;
            Ok(())
        };
        let result = result
            .and_then(|_| self.render())
            .and_then(|text| write_text(path, &text).map(|_| text));
        match result {
            Ok(text) => {
                if path == self.source {
                    self.text = text;
                }
                tracing::info!(path = %path.display(), digest = add_digest, "saved spec");
                true
            }
            Err(err) => diag.exception(&format!("Error saving spec to {}", path.display()), &err),
        }
    }

    /// Full document text with the current outputs and digest.
    pub fn render(&self) -> Result<String> {
        self.render_with_digest(self.digest.as_deref())
    }

    fn render_with_digest(&self, digest: Option<&str>) -> Result<String> {
        let out_block = if self.outputs.is_empty() {
            None
        } else {
            let mut out = Mapping::new();
            for (key, value) in &self.outputs {
                out.insert(Value::String(key.as_str().to_string()), value.clone());
            }
            let mut wrapper = Mapping::new();
            wrapper.insert(Value::String("out".to_string()), Value::Mapping(out));
            Some(serde_yaml::to_string(&wrapper).context("serialize output zone")?)
        };
        let text = document::replace_block(&self.text, "out", out_block.as_deref());
        let text = document::set_digest_line(&text, digest)?;
        serde_yaml::from_str::<Value>(&text).context("re-parse rendered spec")?;
        Ok(text)
    }

    // ------------------------------------------------------------------
    // integrity

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// SHA-256 of the document as it would be saved, with the digest blanked.
    pub fn compute_digest(&self) -> Result<String> {
        let canonical = self.render_with_digest(Some(""))?;
        Ok(sha256_hex(canonical.as_bytes()))
    }

    /// Startup integrity check: a recorded digest must match unless the
    /// operator chose to ignore it. A spec that never carried a digest passes.
    pub fn check_integrity(&self, ignore_digest: bool, diag: &mut Diagnostics) -> bool {
        if ignore_digest {
            return diag.warning("Ignoring spec_sha256 checksum validation. Spec integrity unknown.");
        }
        if self.digest.is_none() {
            tracing::debug!(path = %self.source.display(), "spec carries no digest yet");
            return true;
        }
        self.verify_digest(diag)
    }

    pub fn verify_digest(&self, diag: &mut Diagnostics) -> bool {
        let Some(expected) = self.digest.as_deref() else {
            return diag.error("Spec has no spec_sha256 hash to validate.");
        };
        match self.compute_digest() {
            Ok(actual) if actual == expected => {
                tracing::debug!(digest = expected, "spec digest verified");
                true
            }
            Ok(actual) => diag.error(format!(
                "Spec-sha256 {expected} did not match actual hash {actual}."
            )),
            Err(err) => diag.exception("Computing spec digest failed", &err),
        }
    }
}

fn key_name(key: &Value) -> String {
    match key.as_str() {
        Some(name) => name.to_string(),
        None => format!("{key:?}"),
    }
}

fn zone<T: DeserializeOwned>(raw: &Mapping, key: &str) -> Result<T> {
    let value = raw
        .get(key)
        .cloned()
        .ok_or_else(|| anyhow!("missing section {key}"))?;
    serde_yaml::from_value(value).with_context(|| format!("decode section {key}"))
}

fn optional_zone<T: DeserializeOwned + Default>(raw: &Mapping, key: &str) -> Result<T> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => {
            serde_yaml::from_value(value.clone()).with_context(|| format!("decode section {key}"))
        }
    }
}

fn check_zone(
    raw: &Mapping,
    zone: &str,
    allowed: &[&str],
    required: &[&str],
    diag: &mut Diagnostics,
) -> bool {
    let Some(Value::Mapping(section)) = raw.get(zone) else {
        return diag.error(format!("Section '{zone}' must be a mapping."));
    };
    let mut ok = true;
    for key in section.keys() {
        let name = key.as_str().unwrap_or_default();
        if !allowed.contains(&name) {
            ok = diag.error(format!(
                "Unknown keyword '{}' in section '{zone}'.",
                key_name(key)
            ));
        }
    }
    for key in required {
        if !section.contains_key(*key) {
            ok = diag.error(format!("Missing required field in {zone}: {key}"));
        }
    }
    ok
}

fn check_header_values(header: &Header, diag: &mut Diagnostics) -> bool {
    let mut ok = true;
    let date = Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("regex for ISO dates");
    for (field, value) in [("valid_on", &header.valid_on), ("expires_on", &header.expires_on)] {
        if !date.is_match(value) {
            ok = diag.error(format!(
                "Field image_spec_header.{field} must be a YYYY-MM-DD date, found '{value}'."
            ));
        }
    }
    if ok && header.valid_on > header.expires_on {
        ok = diag.error(format!(
            "Validity window is empty: valid_on {} is after expires_on {}.",
            header.valid_on, header.expires_on
        ));
    }
    for (field, value) in [
        ("image_name", &header.image_name),
        ("kernel_name", &header.kernel_name),
        ("python_version", &header.python_version),
    ] {
        if value.trim().is_empty() {
            ok = diag.error(format!("Field image_spec_header.{field} must not be empty."));
        }
    }
    if header.kernel_name.contains(['/', ' ']) {
        ok = diag.error(format!(
            "Field image_spec_header.kernel_name '{}' must not contain spaces or slashes.",
            header.kernel_name
        ));
    }
    ok
}

fn check_selection_values(document: &SpecDocument, diag: &mut Diagnostics) -> bool {
    let mut ok = true;
    for (idx, selection) in document.selections.iter().enumerate() {
        let repo = selection
            .nb_repo
            .as_deref()
            .or(document.header.nb_repo.as_deref());
        match repo {
            None => {
                ok = diag.error(format!(
                    "Missing required 'nb_repo' field in selected_notebooks[{idx}]."
                ));
            }
            Some(repo) if !is_valid_repo_url(repo) => {
                ok = diag.error(format!(
                    "Invalid repository URL '{repo}' in selected_notebooks[{idx}]."
                ));
            }
            Some(_) => {}
        }
        let patterns = selection
            .include_patterns()
            .into_iter()
            .chain(selection.exclude_subdirs.iter().cloned());
        for pattern in patterns {
            if let Err(err) = Regex::new(&pattern) {
                ok = diag.error(format!(
                    "Invalid pattern '{pattern}' in selected_notebooks[{idx}]: {err}"
                ));
            }
        }
    }
    ok
}

fn check_package_lists(document: &SpecDocument, diag: &mut Diagnostics) -> bool {
    let mut ok = true;
    for (zone, packages) in [
        ("extra_mamba_packages", &document.extra_mamba_packages),
        ("extra_pip_packages", &document.extra_pip_packages),
    ] {
        for package in packages {
            if package.trim().is_empty() {
                ok = diag.error(format!("Empty package entry in {zone}."));
            }
        }
    }
    ok
}

/// Remote URLs (`https://`, `ssh://`, `git@host:path`, `file://`) or
/// absolute local paths.
pub fn is_valid_repo_url(repo: &str) -> bool {
    if repo.starts_with('/') {
        return true;
    }
    if let Ok(url) = url::Url::parse(repo) {
        return match url.scheme() {
            "file" => true,
            "http" | "https" | "ssh" | "git" => url.host_str().is_some_and(|host| !host.is_empty()),
            _ => false,
        };
    }
    let scp_like = Regex::new(r"^[A-Za-z0-9_.\-]+@[A-Za-z0-9_.\-]+:[^\s]+$").expect("regex for scp-like URLs");
    scp_like.is_match(repo)
}

#[cfg(test)]
#[path = "spec_tests.rs"]
mod tests;
