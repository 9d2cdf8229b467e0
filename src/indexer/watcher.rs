// File watcher for incremental updates

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::discovery::path_to_uri;
use super::Indexer;
use crate::config::matches_pattern;

/// Keeps the index in step with changes made outside the editor
pub struct FileWatcher {
    indexer: Arc<Indexer>,
    watch_path: PathBuf,
    exclude: Vec<String>,
}

impl FileWatcher {
    pub fn new(indexer: Arc<Indexer>, watch_path: PathBuf, exclude: Vec<String>) -> Self {
        Self {
            indexer,
            watch_path,
            exclude,
        }
    }

    /// Watch until the event channel closes
    pub async fn watch(&self) -> Result<()> {
        info!("Starting file watcher for: {}", self.watch_path.display());

        let (tx, mut rx) = mpsc::channel(256);

        // notify calls back on its own thread
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if tx.blocking_send(event).is_err() {
                        debug!("File watcher receiver dropped");
                    }
                }
                Err(e) => error!("File watch error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(&self.watch_path, RecursiveMode::Recursive)?;

        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }

        Ok(())
    }

    async fn handle_event(&self, event: Event) {
        debug!("File event: {:?}", event);

        for path in &event.paths {
            let Some(uri) = self.watched_uri(path) else {
                continue;
            };
            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => {
                    // Open documents are owned by the editor
                    if self.indexer.documents().is_open(&uri) {
                        continue;
                    }
                    match self.indexer.index_uri(&uri).await {
                        Ok(outcome) => debug!("Reindexed {}: {:?}", uri, outcome),
                        Err(e) => warn!("Failed to reindex {}: {:#}", uri, e),
                    }
                }
                EventKind::Remove(_) => {
                    if !self.indexer.documents().is_open(&uri) && self.indexer.remove_uri(&uri).await {
                        info!("File removed: {}", uri);
                    }
                }
                _ => {}
            }
        }
    }

    fn watched_uri(&self, path: &Path) -> Option<String> {
        let relative = path
            .strip_prefix(&self.watch_path)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        if self.exclude.iter().any(|pattern| matches_pattern(&relative, pattern)) {
            return None;
        }
        let uri = path_to_uri(path)?;
        self.indexer.can_index(&uri).then_some(uri)
    }
}

/// Spawn a watcher task for a project root
pub fn spawn_watcher(indexer: Arc<Indexer>, root: PathBuf, exclude: Vec<String>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let watcher = FileWatcher::new(indexer, root, exclude);
        if let Err(e) = watcher.watch().await {
            error!("File watcher stopped: {:#}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::index::Repository;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use tempfile::TempDir;

    fn watcher(root: &Path) -> FileWatcher {
        let indexer = Arc::new(Indexer::new(Arc::new(Repository::new()), &Config::default()));
        FileWatcher::new(indexer, root.to_path_buf(), vec!["cache/".to_string()])
    }

    #[tokio::test]
    async fn test_create_and_remove_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.php");
        std::fs::write(&path, "<?php\nclass Watched {}\n").unwrap();
        let watcher = watcher(dir.path());
        let repo = watcher.indexer.repo().clone();

        watcher
            .handle_event(Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone()))
            .await;
        assert!(repo.get_definition("Watched").is_some());

        std::fs::write(&path, "<?php\nclass Changed {}\n").unwrap();
        watcher
            .handle_event(Event::new(EventKind::Modify(ModifyKind::Any)).add_path(path.clone()))
            .await;
        assert!(repo.get_definition("Watched").is_none());
        assert!(repo.get_definition("Changed").is_some());

        std::fs::remove_file(&path).unwrap();
        watcher
            .handle_event(Event::new(EventKind::Remove(RemoveKind::File)).add_path(path))
            .await;
        assert_eq!(repo.stats().files, 0);
    }

    #[test]
    fn test_watched_uri_filters() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher(dir.path());

        assert!(watcher.watched_uri(&dir.path().join("src/a.php")).is_some());
        assert!(watcher.watched_uri(&dir.path().join("src/a.txt")).is_none());
        assert!(watcher.watched_uri(&dir.path().join("cache/a.php")).is_none());
    }
}
