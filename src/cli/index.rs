use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use super::project_root;
use crate::config::Config;
use crate::index::snapshot::SnapshotStore;
use crate::index::Repository;
use crate::indexer::discovery::path_to_uri;
use crate::indexer::watcher::spawn_watcher;
use crate::indexer::{IndexOutcome, Indexer};

pub async fn index_project(project: String, watch: bool, rebuild: bool) -> Result<()> {
    let root = project_root(&project)?;
    let config = Config::from_project_dir(&root);
    let root_uri = path_to_uri(&root).with_context(|| format!("Cannot address {}", root.display()))?;
    let store = SnapshotStore::new(config.cache_path(&root));

    println!("phpls indexer v{}", env!("CARGO_PKG_VERSION"));
    println!("Project: {}", root.display());
    println!("Index: {}", store.path().display());

    let indexer = Arc::new(Indexer::new(Arc::new(Repository::new()), &config));
    if !rebuild && config.cache.enabled && indexer.restore_snapshot(&store) {
        println!("Starting from the existing index");
    }

    let progress = ProgressBar::new_spinner();
    progress.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {pos} files {msg}")?);
    progress.enable_steady_tick(Duration::from_millis(100));

    let report = indexer
        .index_workspace_with(&root_uri, |uri, outcome| {
            progress.inc(1);
            if let Ok(IndexOutcome::Indexed { .. }) = outcome {
                progress.set_message(uri.rsplit('/').next().unwrap_or(uri).to_string());
            }
        })
        .await;
    progress.finish_with_message("done");

    let stats = indexer.repo().stats();
    println!("\nIndexing complete in {:.2?}", report.elapsed);
    println!("  Files discovered: {}", report.discovered);
    println!("  Parsed:           {}", report.indexed);
    println!("  Unchanged:        {}", report.unchanged);
    println!("  Failed:           {}", report.failed);
    println!("  Removed:          {}", report.removed);
    println!("  Definitions:      {}", stats.definitions);
    println!("  References:       {}", stats.references);
    if stats.conflicts > 0 {
        println!("  Duplicate declarations: {}", stats.conflicts);
    }

    if config.cache.enabled {
        indexer.save_snapshot(&store)?;
        info!("Saved index to {}", store.path().display());
    } else {
        println!("Caching disabled; index not saved");
    }

    if watch || config.indexing.watch {
        println!("\nWatching for changes. Press Ctrl+C to stop.");
        let watcher = spawn_watcher(indexer.clone(), root.clone(), config.indexing.exclude.clone());
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        watcher.abort();
        if config.cache.enabled {
            indexer.save_snapshot(&store)?;
            println!("Saved index to {}", store.path().display());
        }
    }

    Ok(())
}
