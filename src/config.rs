//! Store configuration.
//!
//! [`StoreConfig`] is a plain serde record. It can be built in code with [`StoreConfig::new`] or
//! persisted as TOML next to the vault (`docgraph.toml`).

use crate::error::DocGraphError;
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    time::Duration,
};

/// File name looked up in the source root by [`StoreConfig::load`].
pub const CONFIG_FILE_NAME: &str = "docgraph.toml";

/// Directory (relative to the source root) holding the persisted index.
pub const INDEX_DIR: &str = ".docgraph";

pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;
pub const DEFAULT_RENAME_TTL_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Defaults to `<root>/.docgraph/cache.db` when unset.
    pub db_path: Option<PathBuf>,
    pub extensions: Vec<String>,
    /// Appended to link targets and new node paths that carry no extension.
    pub default_extension: String,
    pub debounce_ms: u64,
    pub rename_ttl_ms: u64,
    /// Mint stable ids for documents lacking one and write them back into the file header.
    pub write_ids: bool,
    /// Directory names excluded from scans and file watching.
    pub ignored_dirs: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            root: PathBuf::from("."),
            db_path: None,
            extensions: vec!["md".to_string()],
            default_extension: "md".to_string(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            rename_ttl_ms: DEFAULT_RENAME_TTL_MS,
            write_ids: true,
            ignored_dirs: [INDEX_DIR, ".git", ".hg", ".svn", ".obsidian", ".vscode", ".idea", ".trash"]
                .iter()
                .map(|dir| dir.to_string())
                .collect(),
        }
    }
}

impl StoreConfig {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        StoreConfig {
            root: root.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Read `<root>/docgraph.toml` when present, otherwise return defaults for `root`.
    ///
    /// The `root` argument always wins over a `root` value found in the file, so a vault can
    /// be moved without editing its configuration.
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Self, DocGraphError> {
        let path = root.as_ref().join(CONFIG_FILE_NAME);
        if !path.exists() {
            tracing::debug!("Config file {:?} not found, using defaults.", path);
            return Ok(StoreConfig::new(root));
        }
        let mut config = StoreConfig::from_file(&path)?;
        config.root = root.as_ref().to_path_buf();
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DocGraphError> {
        tracing::debug!("Reading store config from: {:?}", path.as_ref());
        let content = read_to_string(path)?;
        let config: StoreConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DocGraphError> {
        tracing::debug!("Writing store config to: {:?}", path.as_ref());
        let toml_string = toml::to_string(self)?;
        write(path, toml_string)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DocGraphError> {
        if self.extensions.is_empty() {
            return Err(DocGraphError::Config(
                "at least one document extension must be registered".to_string(),
            ));
        }
        if !crate::paths::is_extension(&self.default_extension) {
            return Err(DocGraphError::Config(format!(
                "default_extension '{}' is not a valid extension",
                self.default_extension
            )));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.root.join(INDEX_DIR).join("cache.db"))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn rename_ttl(&self) -> Duration {
        Duration::from_millis(self.rename_ttl_ms)
    }

    pub fn is_ignored_dir(&self, name: &str) -> bool {
        self.ignored_dirs.iter().any(|dir| dir == name)
    }
}
