//! Package manifest loading and workspace layout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// The user-facing package manifest (`package.{json,yaml,yml}`).
#[derive(Debug, Clone, Deserialize)]
pub struct PackageConfig {
    /// Identifier of the embedding model handed to the embedding runtime.
    pub embedding: String,
    /// Scope name -> root directory to index.
    #[serde(default)]
    pub sources: BTreeMap<String, PathBuf>,
}

impl PackageConfig {
    /// Load a manifest from `path`.
    ///
    /// `path` may be the manifest file itself or a directory containing
    /// `package.json`, `package.yaml` or `package.yml` (checked in that
    /// order). Returns the parsed config together with the package
    /// directory the workspace lives under.
    ///
    /// Relative source roots are resolved against the package directory.
    pub fn load(path: &Path) -> Result<(Self, PathBuf)> {
        if !path.exists() {
            return Err(Error::Config(format!("path {} not found", path.display())));
        }

        let manifest_path = if path.is_dir() {
            ["json", "yaml", "yml"]
                .iter()
                .map(|ext| path.join(format!("package.{ext}")))
                .find(|p| p.exists())
                .ok_or_else(|| {
                    Error::Config(format!("no package manifest found in {}", path.display()))
                })?
        } else {
            path.to_path_buf()
        };

        let text = std::fs::read_to_string(&manifest_path)?;
        let mut config: PackageConfig = match manifest_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
        {
            "json" => serde_json::from_str(&text)?,
            "yaml" | "yml" => serde_yaml::from_str(&text)?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported manifest extension: .{other}"
                )))
            }
        };

        let package_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        for root in config.sources.values_mut() {
            if root.is_relative() {
                *root = package_dir.join(&*root);
            }
        }

        Ok((config, package_dir))
    }
}

/// Filesystem layout of the engine's state under `<package>/workspace/`.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(package_dir: &Path) -> Self {
        Self {
            root: package_dir.join("workspace"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scanner tables (`files`, `events`, `scopes`).
    pub fn scanner_db(&self) -> PathBuf {
        self.root.join("scanner.sqlite3")
    }

    /// Content-addressed page artifact cache plus its `pages.db`.
    pub fn pdf_cache_dir(&self) -> PathBuf {
        self.root.join("parser").join("pdf_cache")
    }

    /// Scratch directories used while splitting PDFs.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// `files` table linking user-visible PDFs to pdf hashes.
    pub fn index_db(&self) -> PathBuf {
        self.root.join("indexes").join("index.sqlite3")
    }

    /// FTS virtual table plus the `nodes` catalog.
    pub fn fts_db(&self) -> PathBuf {
        self.root.join("index_fts5.sqlite3")
    }

    /// Persistent vector collection.
    pub fn vector_dir(&self) -> PathBuf {
        self.root.join("vector_db")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.pdf_cache_dir())?;
        std::fs::create_dir_all(self.temp_dir())?;
        std::fs::create_dir_all(self.vector_dir())?;
        if let Some(parent) = self.index_db().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Delete the entire workspace tree. Used by `purge`.
    pub fn purge(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}
