use anyhow::{Context, Result};
use sha2::Digest;
use std::fs;
use std::path::Path;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Write `text` to `path`, creating parent directories first.
pub fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))
}

/// Last path segment of a repository URL without a trailing `.git`.
pub fn repo_basename(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let base = trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed);
    base.strip_suffix(".git").unwrap_or(base).to_string()
}

/// Title centered in a 100-column rule of `*`, newline terminated.
pub fn divider(title: &str) -> String {
    const WIDTH: usize = 100;
    let title = format!(" {title} ");
    let pad = WIDTH.saturating_sub(title.chars().count());
    let left = pad / 2;
    format!("{}{title}{}\n", "*".repeat(left), "*".repeat(pad - left))
}
