// CLI command implementations

pub mod index;
pub mod query;
pub mod serve;
pub mod stats;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::index::snapshot::{IndexSnapshot, SnapshotError, SnapshotStore};

/// Absolute project directory
pub fn project_root(project: &str) -> Result<PathBuf> {
    std::fs::canonicalize(project).with_context(|| format!("Project directory not found: {}", project))
}

/// Snapshot written by `phpls index` for this project
pub fn load_snapshot(root: &Path, config: &Config) -> Result<(SnapshotStore, IndexSnapshot)> {
    let store = SnapshotStore::new(config.cache_path(root));
    match store.load() {
        Ok(snapshot) => Ok((store, snapshot)),
        Err(SnapshotError::Missing(path)) => anyhow::bail!(
            "No index at {}. Run 'phpls index --project {}' first.",
            path.display(),
            root.display()
        ),
        Err(e) => Err(e).with_context(|| format!("Cannot read index {}", store.path().display())),
    }
}
