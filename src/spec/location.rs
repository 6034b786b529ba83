//! Resolve a spec location argument to a local file.
use crate::config::Config;
use crate::process::{self, CommandSpec};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

/// Accepts a plain path, `file://`, `http(s)://` or `s3://`. Remote specs are
/// fetched into `<root>/specs/` and that copy becomes the backing document.
pub fn resolve_spec_location(location: &str, config: &Config) -> Result<PathBuf> {
    let Ok(url) = Url::parse(location) else {
        return Ok(PathBuf::from(location));
    };
    match url.scheme() {
        "file" => url
            .to_file_path()
            .map_err(|_| anyhow!("invalid file URL {location}")),
        "http" | "https" => {
            let dest = download_target(config, &url)?;
            fetch_http(location, &dest)?;
            Ok(dest)
        }
        "s3" => {
            let dest = download_target(config, &url)?;
            let spec = CommandSpec::tool(
                &config.tools.aws,
                &["s3", "cp", location, &dest.display().to_string()],
                config.timeouts.default,
            )?;
            let outcome = process::run(&spec)?;
            if !outcome.success() {
                return Err(anyhow!(
                    "fetch {location} failed ({}): {}",
                    outcome.failure_reason(),
                    outcome.combined_output().trim()
                ));
            }
            Ok(dest)
        }
        // Single-letter schemes are Windows drive letters, anything else unknown.
        scheme if scheme.len() == 1 => Ok(PathBuf::from(location)),
        scheme => Err(anyhow!("unsupported spec location scheme {scheme}://")),
    }
}

fn download_target(config: &Config, url: &Url) -> Result<PathBuf> {
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| anyhow!("spec URL {url} has no file name"))?;
    let dir = config.root.join("specs");
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir.join(name))
}

fn fetch_http(location: &str, dest: &Path) -> Result<()> {
    let mut response = ureq::get(location)
        .call()
        .with_context(|| format!("GET {location}"))?;
    let text = response
        .body_mut()
        .read_to_string()
        .with_context(|| format!("read body of {location}"))?;
    fs::write(dest, text.as_bytes()).with_context(|| format!("write {}", dest.display()))?;
    tracing::info!(url = location, path = %dest.display(), "fetched remote spec");
    Ok(())
}
