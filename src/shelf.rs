//! Pantry layout: one shelf per spec moniker.
//!
//! ```text
//! <pantry>/shelves/<moniker>/
//!   <spec file>
//!   exports
//!   archives/<env><format>
//!   notebooks/
//!   data/
//! ```
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const EXPORTS_FILE: &str = "exports";

#[derive(Debug, Clone)]
pub struct Pantry {
    root: PathBuf,
}

impl Pantry {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn shelves_dir(&self) -> PathBuf {
        self.root.join("shelves")
    }

    pub fn shelf(&self, moniker: &str) -> Shelf {
        Shelf {
            path: self.shelves_dir().join(moniker),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Shelf {
    path: PathBuf,
}

impl Shelf {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn archive_root(&self) -> PathBuf {
        self.path.join("archives")
    }

    pub fn notebooks_dir(&self) -> PathBuf {
        self.path.join("notebooks")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.path.join("data")
    }

    /// Environment archive for `env_name` in the given `.tar*` format.
    pub fn env_archive(&self, env_name: &str, format: &str) -> PathBuf {
        self.archive_root().join(format!("{env_name}{format}"))
    }

    /// Create the shelf and its fixed subdirectories.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.path.clone(),
            self.archive_root(),
            self.notebooks_dir(),
            self.data_dir(),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Write the `exports` shell file; returns its path.
    pub fn save_exports(&self, exports: &str) -> Result<PathBuf> {
        let path = self.path.join(EXPORTS_FILE);
        crate::util::write_text(&path, exports)?;
        tracing::info!(path = %path.display(), "wrote data exports");
        Ok(path)
    }
}
