use super::{extract_imports, find_notebooks, line_imports, notebook_imports};
use crate::diagnostics::Diagnostics;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_root(name: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    let root = std::env::temp_dir().join(format!("{name}-{}-{now}", std::process::id()));
    fs::create_dir_all(&root).expect("create temp root");
    root
}

fn write_file(root: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    fs::write(&path, contents).expect("write file");
    path
}

fn notebook(cells: serde_json::Value) -> String {
    json!({ "cells": cells, "metadata": {}, "nbformat": 4, "nbformat_minor": 5 }).to_string()
}

fn rel_names(root: &Path, paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|path| {
            path.strip_prefix(root)
                .expect("under root")
                .display()
                .to_string()
        })
        .collect()
}

#[test]
fn import_extraction_keeps_root_packages_only() {
    let nb = json!({
        "cells": [
            { "cell_type": "code", "source": ["import numpy as np\n", "from os import path\n"] },
            { "cell_type": "code", "source": "import scipy.stats\n" },
            { "cell_type": "markdown", "source": ["import pandas\n"] }
        ]
    });
    let imports: Vec<String> = notebook_imports(&nb).into_iter().collect();
    assert_eq!(imports, vec!["numpy".to_string(), "scipy".to_string()]);
}

#[test]
fn line_imports_handles_lists_and_relative_forms() {
    assert_eq!(line_imports("import astropy.units as u, numpy"), vec!["astropy", "numpy"]);
    assert_eq!(line_imports("from __future__ import annotations"), Vec::<String>::new());
    assert_eq!(line_imports("from . import helpers"), Vec::<String>::new());
    assert_eq!(line_imports("# import matplotlib"), Vec::<String>::new());
    assert_eq!(line_imports("important = 1"), Vec::<String>::new());
    assert_eq!(line_imports("from sys import argv"), Vec::<String>::new());
}

#[test]
fn exclude_wins_over_include_and_checkpoints_are_dropped() {
    let root = temp_root("nbenv-discovery-filter");
    let empty = notebook(json!([]));
    write_file(&root, "calibration/flat.ipynb", &empty);
    write_file(&root, "calibration/draft/flat-draft.ipynb", &empty);
    write_file(&root, "calibration/.ipynb_checkpoints/flat-checkpoint.ipynb", &empty);
    write_file(&root, "imaging/psf.ipynb", &empty);
    write_file(&root, "calibration/notes.md", "not a notebook");

    let found = find_notebooks(
        &root,
        &["calibration".to_string()],
        &["draft".to_string()],
    )
    .expect("find notebooks");
    assert_eq!(rel_names(&root, &found), vec!["calibration/flat.ipynb".to_string()]);

    let everything = find_notebooks(&root, &[".".to_string()], &[]).expect("find notebooks");
    assert_eq!(
        rel_names(&root, &everything),
        vec![
            "calibration/draft/flat-draft.ipynb".to_string(),
            "calibration/flat.ipynb".to_string(),
            "imaging/psf.ipynb".to_string(),
        ]
    );
    let _ = fs::remove_dir_all(root);
}

#[test]
fn patterns_see_the_clone_and_root_directories() {
    let root = temp_root("nbenv-discovery-fullpath");
    let empty = notebook(json!([]));
    let search_root = root.join("roman_notebooks/notebooks");
    write_file(&search_root, "calibration/cal.ipynb", &empty);
    write_file(&search_root, "imaging/psf.ipynb", &empty);

    let found = find_notebooks(&search_root, &["notebooks/calibration".to_string()], &[])
        .expect("find notebooks");
    assert_eq!(rel_names(&search_root, &found), vec!["calibration/cal.ipynb".to_string()]);

    let none = find_notebooks(&search_root, &[".".to_string()], &["roman_notebooks/".to_string()])
        .expect("find notebooks");
    assert!(none.is_empty());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn missing_root_yields_no_notebooks() {
    let root = temp_root("nbenv-discovery-missing");
    let found = find_notebooks(&root.join("absent"), &[".".to_string()], &[]).expect("find");
    assert!(found.is_empty());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn malformed_notebooks_are_skipped_with_a_warning() {
    let root = temp_root("nbenv-discovery-malformed");
    let good = write_file(
        &root,
        "good.ipynb",
        &notebook(json!([{ "cell_type": "code", "source": ["import pandas as pd\n"] }])),
    );
    let bad = write_file(&root, "bad.ipynb", "{ not json");
    let paths = vec![
        good.display().to_string(),
        bad.display().to_string(),
        good.display().to_string(),
    ];
    let mut diag = Diagnostics::new();
    let scan = extract_imports(&paths, &mut diag);
    assert_eq!(diag.warning_count(), 1);
    assert_eq!(diag.error_count(), 0);
    assert_eq!(scan.packages.into_iter().collect::<Vec<_>>(), vec!["pandas".to_string()]);
    assert_eq!(scan.by_notebook.len(), 1);
    assert_eq!(
        scan.by_notebook.get(&good.display().to_string()),
        Some(&vec!["pandas".to_string()])
    );
    let _ = fs::remove_dir_all(root);
}
