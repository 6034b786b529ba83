use super::{TestStatus, ValidationRunner};
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

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

fn write_script(root: &Path, name: &str, body: &str) -> PathBuf {
    let path = write_file(root, &format!("bin/{name}"), &format!("#!/bin/sh\n{body}"));
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn fake_config(root: &Path) -> Config {
    let mamba = write_script(root, "micromamba", "shift 3\nexec \"$@\"\n");
    let python = write_script(
        root,
        "python",
        "case \"$2\" in\n  *missing_pkg*) echo \"ModuleNotFoundError: missing_pkg\" >&2; exit 1 ;;\nesac\nexit 0\n",
    );
    let runner = write_script(
        root,
        "papermill",
        r#"case "$2" in
  *slow*) sleep 30 ;;
  *broken*) echo "cell raised" >&2; exit 3 ;;
esac
touch written-by-test
echo "executed $2 with kernel $4"
"#,
    );
    let mut config = Config::with_root(&root.join("live"));
    config.tools.mamba = mamba.display().to_string();
    config.tools.python = python.display().to_string();
    config.tools.notebook_runner = runner.display().to_string();
    config
}

#[test]
fn filter_matches_any_pattern_and_drops_checkpoints() {
    let config = Config::with_root(Path::new("/tmp/nbenv-unused"));
    let runner = ValidationRunner::new(&config);
    let notebooks = vec![
        "/r/nb/calibration/flat.ipynb".to_string(),
        "/r/nb/imaging/psf.ipynb".to_string(),
        "/r/nb/imaging/.ipynb_checkpoints/psf-checkpoint.ipynb".to_string(),
        "/r/nb/spectra/fit.ipynb".to_string(),
        "/r/nb/calibration/flat.ipynb".to_string(),
    ];
    let filtered = runner
        .filter_notebooks(&notebooks, "calibration,imaging")
        .expect("filter");
    assert_eq!(
        filtered,
        vec![
            "/r/nb/calibration/flat.ipynb".to_string(),
            "/r/nb/imaging/psf.ipynb".to_string(),
        ]
    );
    assert!(runner.filter_notebooks(&notebooks, "(unclosed").is_err());
}

#[test]
fn import_checks_are_exhaustive() {
    let root = temp_root("nbenv-validation-imports");
    let config = fake_config(&root);
    let runner = ValidationRunner::new(&config);
    let mut diag = Diagnostics::new();
    let packages = vec![
        "missing_pkg".to_string(),
        "numpy".to_string(),
        "scipy".to_string(),
    ];
    let report = runner.test_imports("roman-cal", &packages, &mut diag);
    assert!(!report.all_passed());
    assert_eq!(report.passed, vec!["numpy".to_string(), "scipy".to_string()]);
    assert!(report.failed["missing_pkg"].contains("ModuleNotFoundError"));
    assert_eq!(diag.error_count(), 2);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn notebooks_run_in_private_copies_with_timeouts() {
    let root = temp_root("nbenv-validation-notebooks");
    let mut config = fake_config(&root);
    config.jobs = 2;
    config.timeouts.notebook = Duration::from_secs(1);
    let notebooks: Vec<String> = [
        "repo/nb/good/good.ipynb",
        "repo/nb/slow/slow.ipynb",
        "repo/nb/broken/broken.ipynb",
    ]
    .iter()
    .map(|rel| write_file(&root, rel, "{\"cells\": []}").display().to_string())
    .collect();

    let runner = ValidationRunner::new(&config);
    let mut diag = Diagnostics::new();
    let start = Instant::now();
    let results = runner.test_notebooks("roman-cal", &notebooks, &mut diag);
    assert!(start.elapsed() < Duration::from_secs(20));

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].notebook, notebooks[0]);
    assert_eq!(results[0].status, TestStatus::Passed);
    assert!(results[0].output.contains("executed good.ipynb with kernel roman-cal"));
    assert_eq!(results[1].status, TestStatus::TimedOut);
    assert_eq!(results[2].status, TestStatus::Failed);
    assert_eq!(results[2].exit_code, Some(3));
    assert!(results[2].output.contains("cell raised"));
    assert_eq!(diag.error_count(), 2);

    assert!(!root.join("repo/nb/good/written-by-test").exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn commented_out_notebooks_are_skipped() {
    let root = temp_root("nbenv-validation-skip");
    let config = fake_config(&root);
    let runner = ValidationRunner::new(&config);
    let mut diag = Diagnostics::new();
    let results = runner.test_notebooks("roman-cal", &["#repo/nb/old.ipynb".to_string()], &mut diag);
    assert_eq!(results[0].status, TestStatus::Skipped);
    assert_eq!(diag.error_count(), 0);
    let _ = fs::remove_dir_all(root);
}
