use super::RepositorySet;
use crate::config::{Config, DirtyPolicy, RepoMode};
use crate::diagnostics::Diagnostics;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
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

fn have_git() -> bool {
    which::which("git").is_ok()
}

fn git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_AUTHOR_NAME", "nbenv")
        .env("GIT_AUTHOR_EMAIL", "nbenv@example.invalid")
        .env("GIT_COMMITTER_NAME", "nbenv")
        .env("GIT_COMMITTER_EMAIL", "nbenv@example.invalid")
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Upstream repository with one commit per entry of `files`.
fn upstream(root: &Path, name: &str, files: &[(&str, &str)]) -> (String, Vec<String>) {
    let dir = root.join("upstream").join(name);
    fs::create_dir_all(&dir).expect("create upstream");
    git(&dir, &["init", "--quiet"]);
    let mut commits = Vec::new();
    for (rel, contents) in files {
        commit_file(&dir, rel, contents);
        commits.push(git(&dir, &["rev-parse", "HEAD"]));
    }
    (dir.display().to_string(), commits)
}

fn commit_file(dir: &Path, rel: &str, contents: &str) -> String {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    fs::write(&path, contents).expect("write file");
    git(dir, &["add", "."]);
    git(dir, &["commit", "--quiet", "-m", &format!("add {rel}")]);
    git(dir, &["rev-parse", "HEAD"])
}

fn config(root: &Path) -> Config {
    Config::with_root(&root.join("live"))
}

#[test]
fn clean_resolve_is_idempotent() {
    if !have_git() {
        return;
    }
    let root = temp_root("nbenv-repo-clean");
    let (url, commits) = upstream(&root, "notebooks", &[("a.ipynb", "{}")]);
    let config = config(&root);
    let repos = RepositorySet::new(&config);

    let first = repos.resolve_all(std::slice::from_ref(&url), &BTreeMap::new());
    assert!(first.is_complete(), "{:?}", first.failures);
    let state = &first.resolved[&url];
    assert_eq!(state.commit, commits[0]);
    assert_eq!(state.path, config.repos_dir.join("notebooks"));
    assert!(state.path.join("a.ipynb").is_file());

    let second = repos.resolve_all(std::slice::from_ref(&url), &BTreeMap::new());
    assert!(second.is_complete());
    assert_eq!(second.commits(), first.commits());
    assert!(repos.is_clean(&state.path).expect("status"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn floating_mode_advances_and_locked_mode_pins() {
    if !have_git() {
        return;
    }
    let root = temp_root("nbenv-repo-modes");
    let (url, commits) = upstream(&root, "notebooks", &[("a.ipynb", "{}")]);
    let mut config = config(&root);
    let refs = BTreeMap::new();
    assert!(RepositorySet::new(&config)
        .resolve_all(std::slice::from_ref(&url), &refs)
        .is_complete());

    let second = commit_file(Path::new(&url), "b.ipynb", "{}");
    let floating = RepositorySet::new(&config).resolve_all(std::slice::from_ref(&url), &refs);
    assert_eq!(floating.resolved[&url].commit, second);

    config.repo_mode = RepoMode::Locked;
    let pinned: BTreeMap<String, String> = [(url.clone(), commits[0].clone())].into();
    let locked = RepositorySet::new(&config).resolve_all(std::slice::from_ref(&url), &pinned);
    assert!(locked.is_complete(), "{:?}", locked.failures);
    assert_eq!(locked.resolved[&url].commit, commits[0]);

    commit_file(Path::new(&url), "c.ipynb", "{}");
    let again = RepositorySet::new(&config).resolve_all(std::slice::from_ref(&url), &pinned);
    assert_eq!(again.resolved[&url].commit, commits[0]);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn floating_after_locked_returns_to_the_default_branch() {
    if !have_git() {
        return;
    }
    let root = temp_root("nbenv-repo-unlock");
    let (url, commits) = upstream(&root, "notebooks", &[("a.ipynb", "{}"), ("b.ipynb", "{}")]);
    let mut config = config(&root);
    assert!(RepositorySet::new(&config)
        .resolve_all(std::slice::from_ref(&url), &BTreeMap::new())
        .is_complete());

    config.repo_mode = RepoMode::Locked;
    let pinned: BTreeMap<String, String> = [(url.clone(), commits[0].clone())].into();
    let locked = RepositorySet::new(&config).resolve_all(std::slice::from_ref(&url), &pinned);
    assert_eq!(locked.resolved[&url].commit, commits[0]);

    let newest = commit_file(Path::new(&url), "c.ipynb", "{}");
    config.repo_mode = RepoMode::Floating;
    let floating = RepositorySet::new(&config).resolve_all(std::slice::from_ref(&url), &BTreeMap::new());
    assert!(floating.is_complete(), "{:?}", floating.failures);
    let state = &floating.resolved[&url];
    assert_eq!(state.commit, newest);
    let branch = git(&state.path, &["rev-parse", "--abbrev-ref", "HEAD"]);
    assert_ne!(branch, "HEAD", "working copy left detached");
    let _ = fs::remove_dir_all(root);
}

#[test]
fn dirty_working_copy_fails_untouched_unless_discarded() {
    if !have_git() {
        return;
    }
    let root = temp_root("nbenv-repo-dirty");
    let (url, _) = upstream(&root, "notebooks", &[("a.ipynb", "{}")]);
    let mut config = config(&root);
    let refs = BTreeMap::new();
    let first = RepositorySet::new(&config).resolve_all(std::slice::from_ref(&url), &refs);
    let local = first.resolved[&url].path.join("a.ipynb");
    fs::write(&local, "{\"edited\": true}").expect("edit clone");

    let report = RepositorySet::new(&config).resolve_all(std::slice::from_ref(&url), &refs);
    assert!(report.resolved.is_empty());
    assert!(report.failures[&url].contains("uncommitted changes"));
    assert_eq!(fs::read_to_string(&local).expect("read"), "{\"edited\": true}");

    config.dirty_policy = DirtyPolicy::Discard;
    let report = RepositorySet::new(&config).resolve_all(std::slice::from_ref(&url), &refs);
    assert!(report.is_complete(), "{:?}", report.failures);
    assert_eq!(fs::read_to_string(&local).expect("read"), "{}");
    let _ = fs::remove_dir_all(root);
}

#[test]
fn one_failure_keeps_sibling_results() {
    if !have_git() {
        return;
    }
    let root = temp_root("nbenv-repo-partial");
    let (good, _) = upstream(&root, "good", &[("a.ipynb", "{}")]);
    let missing = root.join("upstream/missing").display().to_string();
    let config = config(&root);
    let report = RepositorySet::new(&config).resolve_all(&[good.clone(), missing.clone()], &BTreeMap::new());
    assert!(report.resolved.contains_key(&good));
    assert!(report.failures.contains_key(&missing));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn delete_all_prunes_empty_repos_dir() {
    if !have_git() {
        return;
    }
    let root = temp_root("nbenv-repo-delete");
    let (url, _) = upstream(&root, "notebooks", &[("a.ipynb", "{}")]);
    let config = config(&root);
    let repos = RepositorySet::new(&config);
    assert!(repos.resolve_all(std::slice::from_ref(&url), &BTreeMap::new()).is_complete());
    let mut diag = Diagnostics::new();
    assert!(repos.delete_all(&[url], &mut diag));
    assert!(!config.repos_dir.exists());
    let _ = fs::remove_dir_all(root);
}
