use super::{Pipeline, StepSelection, Workflow};
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::gate::StageState;
use crate::spec::{OutputKey, SpecStore};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const NOTEBOOK: &str = r#"{"cells": [{"cell_type": "code", "source": ["import numpy as np\n", "from astropy.io import fits\n"]}]}"#;

fn write_file(root: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    fs::write(&path, contents).expect("write file");
    path
}

fn write_script(root: &Path, name: &str, body: &str) -> String {
    let path = write_file(root, &format!("bin/{name}"), &format!("#!/bin/sh\n{body}"));
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path.display().to_string()
}

fn spec_text(root: &Path) -> String {
    format!(
        "\
image_spec_header:
  image_name: Roman Research Nexus
  deployment_name: roman
  kernel_name: roman-cal
  display_name: Roman Calibration
  python_version: '3.11'
  valid_on: 2025-01-01
  expires_on: 2026-01-01
  nb_repo: {}/origin/roman_notebooks
selected_notebooks:
  - nb_root_directory: notebooks
extra_pip_packages:
  - astropy
system:
  spec_version: 1.0
",
        root.display()
    )
}

/// Live root with fake tools and an already-populated clone directory.
fn setup(root: &Path) -> (Config, SpecStore) {
    write_file(root, "live/references/roman_notebooks/notebooks/psf/psf.ipynb", NOTEBOOK);
    write_file(
        root,
        "live/references/roman_notebooks/notebooks/psf/requirements.txt",
        "numpy==2.1.0\n",
    );
    write_file(
        root,
        "live/references/roman_notebooks/refdata_dependencies.yaml",
        "other_variables:\n  CRDS_CONTEXT: roman_0042.pmap\n",
    );
    let resolver = write_script(
        root,
        "resolver",
        "touch \"$(dirname \"$0\")/resolver-ran\"\nprintf 'astropy==6.1.0\\nnumpy==2.1.0\\n' > \"$3\"\n",
    );
    let mamba = write_script(root, "micromamba", "shift 3\nexec \"$@\"\n");
    let python = write_script(
        root,
        "python",
        "case \"$2\" in\n  *astropy*) echo \"No module named astropy\" >&2; exit 1 ;;\nesac\nexit 0\n",
    );

    let mut config = Config::with_root(&root.join("live"));
    config.tools.resolver = resolver;
    config.tools.mamba = mamba;
    config.tools.python = python;
    config.pantry_dir = root.join("pantry");

    let spec_path = write_file(root, "roman-spec.yaml", &spec_text(root));
    let mut spec = SpecStore::load(&spec_path).expect("load spec");
    let mut diag = Diagnostics::new();
    assert!(spec.validate(&mut diag), "{:?}", diag.errors);
    (config, spec)
}

fn steps(configure: impl FnOnce(&mut StepSelection)) -> StepSelection {
    let mut steps = StepSelection::default();
    configure(&mut steps);
    steps
}

fn discover_and_compile(pipeline: &mut Pipeline<'_>, diag: &mut Diagnostics) -> bool {
    pipeline.run_stage(super::Stage::Discovery, diag) && pipeline.run_stage(super::Stage::Compile, diag)
}

#[test]
fn status_of_a_fresh_spec_is_not_started() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (config, spec) = setup(temp.path());
    let pipeline = Pipeline::new(&config, spec);
    let verdicts = pipeline.status();
    assert_eq!(verdicts.len(), 6);
    assert!(verdicts.iter().all(|verdict| verdict.state == StageState::NotStarted));
}

#[test]
fn compile_records_manifest_outputs_and_artifacts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (config, spec) = setup(temp.path());
    let mut pipeline = Pipeline::new(&config, spec);
    let mut diag = Diagnostics::new();
    assert!(discover_and_compile(&mut pipeline, &mut diag), "{:?}", diag.errors);

    let spec = pipeline.spec();
    let imports: Vec<String> = spec.output(OutputKey::TestImports).expect("imports");
    assert_eq!(imports, vec!["astropy".to_string(), "numpy".to_string()]);
    let versions: Vec<String> = spec.output(OutputKey::PackageVersions).expect("versions");
    assert_eq!(versions, vec!["astropy==6.1.0".to_string(), "numpy==2.1.0".to_string()]);
    let mamba: String = spec.output(OutputKey::MambaSpec).expect("mamba spec");
    assert!(mamba.contains("python=3.11"));

    let artifacts = pipeline.artifacts();
    assert!(artifacts.mamba_spec.is_file());
    assert_eq!(
        fs::read_to_string(&artifacts.extra_pip).expect("extra pip"),
        "astropy\n"
    );
    let saved = fs::read_to_string(spec.source()).expect("saved spec");
    assert!(saved.contains("spec_sha256:"));
    assert_eq!(
        pipeline.gate.classify(super::Stage::Compile, pipeline.spec()).0,
        StageState::OutputsPresentAndValid
    );
}

#[test]
fn conflicting_injected_pin_stops_before_the_resolver() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (mut config, spec) = setup(temp.path());
    let injected = write_file(temp.path(), "injected/requirements.txt", "numpy==1.26.4\n");
    config.injected_requirements = vec![injected.clone()];
    let mut pipeline = Pipeline::new(&config, spec);
    let mut diag = Diagnostics::new();
    assert!(!discover_and_compile(&mut pipeline, &mut diag));

    let conflict = diag
        .errors
        .iter()
        .find(|err| err.starts_with("Conflicting pins for 'numpy'"))
        .expect("conflict reported");
    assert!(conflict.contains("psf/requirements.txt"));
    assert!(conflict.contains(&injected.display().to_string()));
    assert!(!temp.path().join("bin/resolver-ran").exists());
    assert!(pipeline.spec().output_value(OutputKey::PackageVersions).is_none());
}

#[test]
fn reinstall_requires_compiled_outputs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (config, spec) = setup(temp.path());
    let mut pipeline = Pipeline::new(&config, spec);
    let mut diag = Diagnostics::new();
    assert!(!pipeline.run(Workflow::Reinstall, &StepSelection::default(), &mut diag));
    assert!(diag.errors[0].contains("precompiled spec"));
}

#[test]
fn import_failures_are_recorded_in_test_results() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (config, spec) = setup(temp.path());
    let mut pipeline = Pipeline::new(&config, spec);
    let mut diag = Diagnostics::new();
    assert!(pipeline.run_stage(super::Stage::Discovery, &mut diag));

    let selection = steps(|steps| steps.test_imports = true);
    assert!(!pipeline.run(Workflow::Explicit, &selection, &mut diag));
    let results = pipeline.spec().output_value(OutputKey::TestResults).expect("results");
    let failed = results["imports"]["failed"].as_mapping().expect("failed map");
    assert_eq!(failed.len(), 1);
    assert!(failed.contains_key("astropy"));
    assert!(diag.errors.iter().any(|err| err.contains("FAILED step test_imports")));
}

#[test]
fn data_collection_feeds_the_shelf_exports_in_one_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (config, mut spec) = setup(temp.path());
    let url = format!("{}/origin/roman_notebooks", temp.path().display());
    spec.set_output(OutputKey::NotebookRepoUrls, &[url]).expect("set");
    let mut pipeline = Pipeline::new(&config, spec);
    let mut diag = Diagnostics::new();
    let selection = steps(|steps| {
        steps.shelve_spec = true;
        steps.data_collect = true;
    });
    assert!(pipeline.run(Workflow::Explicit, &selection, &mut diag), "{:?}", diag.errors);

    let shelf = temp.path().join("pantry/shelves/roman-research-nexus-roman-cal");
    assert!(shelf.join("roman-spec.yaml").is_file());
    assert_eq!(
        fs::read_to_string(shelf.join("exports")).expect("exports"),
        "export CRDS_CONTEXT=roman_0042.pmap\n"
    );
    assert_eq!(pipeline.steps_run, vec!["data_collect", "shelve_spec"]);
}

#[test]
fn selected_steps_run_in_declaration_order() {
    let selection = steps(|steps| {
        steps.reset_spec = true;
        steps.clone_repos = true;
        steps.test_notebooks = Some("psf".to_string());
    });
    let order: Vec<&str> = selection.selected().iter().map(|step| step.as_str()).collect();
    assert_eq!(order, vec!["clone_repos", "test_notebooks", "reset_spec"]);

    let shelving = steps(|steps| {
        steps.shelve_spec = true;
        steps.data_collect = true;
    });
    let order: Vec<&str> = shelving.selected().iter().map(|step| step.as_str()).collect();
    assert_eq!(order, vec!["data_collect", "shelve_spec"]);
    assert!(StepSelection::default().is_empty());
}

#[test]
fn status_lines_name_stage_state_and_cause() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (config, spec) = setup(temp.path());
    let pipeline = Pipeline::new(&config, spec);
    let text = super::format_status(&pipeline.status());
    let first = text.lines().next().expect("first line");
    assert!(first.starts_with("repositories"));
    assert!(first.contains("not-started"));
    assert!(first.contains("notebook_repo_urls"));
    assert_eq!(text.lines().count(), 6);
}
