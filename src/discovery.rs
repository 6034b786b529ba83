//! Notebook discovery and import scanning.
//!
//! # Selection rules
//!
//! - Every `*.ipynb` file under the search root is a candidate.
//! - Patterns are regexes searched against the path relative to the search
//!   root, using `/` separators.
//! - A candidate is kept when it matches at least one include pattern and no
//!   exclude pattern; exclude always wins.
//! - Jupyter checkpoint copies are always excluded.
use crate::diagnostics::Diagnostics;
use crate::spec::SpecStore;
use crate::util::repo_basename;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

pub const CHECKPOINT_PATTERN: &str = r"(^|/)\.ipynb_checkpoints(/|/.*-checkpoint\.ipynb$)";

/// Root modules never worth an import test.
pub const BUILTIN_PACKAGES: [&str; 5] = ["__future__", "builtins", "sys", "os", "copy"];

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:import\s+([A-Za-z0-9_.]+(?:\s+as\s+\w+)?(?:\s*,\s*[A-Za-z0-9_.]+(?:\s+as\s+\w+)?)*)|from\s+([A-Za-z0-9_.]+)\s+import\b)")
            .expect("regex for import statements")
    })
}

/// Imports found across a set of notebooks.
#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct ImportScan {
    pub packages: BTreeSet<String>,
    pub by_notebook: BTreeMap<String, Vec<String>>,
}

/// Candidate notebooks under `root`, filtered by include and exclude patterns.
///
/// Patterns are searched for anywhere in the full notebook path, so they may
/// name the clone directory or the selection root as well as subdirectories.
pub fn find_notebooks(root: &Path, include: &[String], exclude: &[String]) -> Result<Vec<PathBuf>> {
    let include = compile_patterns(include)?;
    let mut exclude = compile_patterns(exclude)?;
    exclude.push(Regex::new(CHECKPOINT_PATTERN).expect("regex for checkpoint files"));

    if !root.is_dir() {
        tracing::debug!(root = %root.display(), "notebook root missing");
        return Ok(Vec::new());
    }

    let mut notebooks = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("ipynb") {
            continue;
        }
        let full = path.display().to_string();
        let included = include.iter().any(|re| re.is_match(&full));
        let excluded = exclude.iter().any(|re| re.is_match(&full));
        if included && !excluded {
            notebooks.push(path.to_path_buf());
        } else {
            tracing::trace!(path = %full, included, excluded, "notebook filtered out");
        }
    }
    Ok(notebooks)
}

/// Notebooks named by every selection entry of a validated spec, given the
/// directory holding the repository clones.
pub fn collect_selected(spec: &SpecStore, repos_dir: &Path, diag: &mut Diagnostics) -> Vec<String> {
    let mut found = BTreeSet::new();
    for (idx, selection) in spec.selections().iter().enumerate() {
        let repo = spec.selection_repo(selection);
        let clone_dir = repos_dir.join(repo_basename(repo));
        if !clone_dir.is_dir() {
            diag.error(format!(
                "Repository for selected_notebooks[{idx}] not set up at {}",
                clone_dir.display()
            ));
            continue;
        }
        let root = match spec.selection_root(selection) {
            "" => clone_dir,
            sub => clone_dir.join(sub),
        };
        match find_notebooks(&root, &selection.include_patterns(), &selection.exclude_subdirs) {
            Ok(paths) => {
                tracing::debug!(root = %root.display(), count = paths.len(), "selected notebooks");
                found.extend(paths.into_iter().map(|path| path.display().to_string()));
            }
            Err(err) => {
                diag.exception(&format!("Scanning {}", root.display()), &err);
            }
        }
    }
    tracing::info!(count = found.len(), "found notebooks in all notebook repositories");
    found.into_iter().collect()
}

/// Root packages imported by the code cells of each notebook.
///
/// Unreadable or malformed notebooks are skipped with a warning.
pub fn extract_imports(paths: &[String], diag: &mut Diagnostics) -> ImportScan {
    let mut scan = ImportScan::default();
    let unique: BTreeSet<&String> = paths.iter().collect();
    for path in unique {
        let notebook = match read_notebook(Path::new(path)) {
            Ok(notebook) => notebook,
            Err(err) => {
                diag.warning(format!("Could not parse notebook {path}: {err:#}"));
                continue;
            }
        };
        let imports = notebook_imports(&notebook);
        tracing::debug!(notebook = %path, count = imports.len(), "extracted imports");
        scan.packages.extend(imports.iter().cloned());
        scan.by_notebook.insert(path.clone(), imports.into_iter().collect());
    }
    tracing::info!(
        packages = scan.packages.len(),
        notebooks = scan.by_notebook.len(),
        "extracted package imports"
    );
    scan
}

fn read_notebook(path: &Path) -> Result<Value> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let notebook: Value = serde_json::from_slice(&bytes).context("parse notebook JSON")?;
    if !notebook.get("cells").is_some_and(Value::is_array) {
        anyhow::bail!("notebook has no cells array");
    }
    Ok(notebook)
}

/// Imports of one parsed notebook document.
pub fn notebook_imports(notebook: &Value) -> BTreeSet<String> {
    let mut imports = BTreeSet::new();
    let cells = notebook
        .get("cells")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for cell in cells {
        if cell.get("cell_type").and_then(Value::as_str) != Some("code") {
            continue;
        }
        for line in cell_source(cell).lines() {
            imports.extend(line_imports(line.trim()));
        }
    }
    imports
}

fn cell_source(cell: &Value) -> String {
    match cell.get("source") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts.iter().filter_map(Value::as_str).collect(),
        _ => String::new(),
    }
}

/// Root package names introduced by one (trimmed) source line.
pub fn line_imports(line: &str) -> Vec<String> {
    let Some(caps) = import_re().captures(line) else {
        return Vec::new();
    };
    let modules: Vec<&str> = match (caps.get(1), caps.get(2)) {
        (Some(list), _) => list
            .as_str()
            .split(',')
            .filter_map(|part| part.split_whitespace().next())
            .collect(),
        (None, Some(module)) => vec![module.as_str()],
        (None, None) => Vec::new(),
    };
    modules
        .into_iter()
        .filter_map(|module| module.split('.').next())
        .filter(|root| !root.is_empty() && !BUILTIN_PACKAGES.contains(root))
        .map(str::to_string)
        .collect()
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).with_context(|| format!("compile pattern {pattern:?}")))
        .collect()
}

#[cfg(test)]
#[path = "discovery_tests.rs"]
mod tests;
