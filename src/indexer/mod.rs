// Workspace indexing: discovery, change detection and per-file updates

pub mod collector;
pub mod discovery;
pub mod documents;
pub mod watcher;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, IndexingConfig};
use crate::index::snapshot::{SnapshotError, SnapshotStore};
use crate::index::Repository;
use crate::syntax::{PhpSyntaxProvider, SyntaxProvider, SyntaxTree};
use discovery::{ContentRetriever, FileFinder, FsContentRetriever, WalkdirFinder};
use documents::{Document, DocumentStore};

/// Result of indexing one URI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed { definitions: usize, references: usize },
    /// Content hash matched the stored file
    Unchanged,
    /// No syntax provider for this URI
    Skipped,
}

/// Summary of a workspace sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub discovered: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
    pub elapsed: Duration,
}

enum Source {
    Overlay(Arc<Document>),
    Disk(Arc<str>),
}

impl Source {
    fn text(&self) -> &str {
        match self {
            Source::Overlay(document) => document.text.as_ref(),
            Source::Disk(text) => text.as_ref(),
        }
    }
}

/// Feeds parsed files into the repository
pub struct Indexer {
    repo: Arc<Repository>,
    provider: Arc<dyn SyntaxProvider>,
    finder: Arc<dyn FileFinder>,
    content: Arc<dyn ContentRetriever>,
    documents: Arc<DocumentStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    config: IndexingConfig,
}

impl Indexer {
    /// Local file system services and the PHP provider
    pub fn new(repo: Arc<Repository>, config: &Config) -> Self {
        Self::with_services(
            repo,
            Arc::new(PhpSyntaxProvider::new()),
            Arc::new(WalkdirFinder::new(config.indexing.exclude.clone())),
            Arc::new(FsContentRetriever),
            config.indexing.clone(),
        )
    }

    pub fn with_services(
        repo: Arc<Repository>,
        provider: Arc<dyn SyntaxProvider>,
        finder: Arc<dyn FileFinder>,
        content: Arc<dyn ContentRetriever>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            repo,
            provider,
            finder,
            content,
            documents: Arc::new(DocumentStore::new()),
            locks: DashMap::new(),
            config,
        }
    }

    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn can_index(&self, uri: &str) -> bool {
        self.provider.can_parse(uri)
    }

    fn lock_for(&self, uri: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn source(&self, uri: &str) -> Result<Source> {
        match self.documents.get(uri) {
            Some(document) => Ok(Source::Overlay(document)),
            None => Ok(Source::Disk(Arc::from(self.content.retrieve(uri).await?))),
        }
    }

    /// Sweep every file under `root_uri`, then flip the index to complete
    pub async fn index_workspace(&self, root_uri: &str) -> IndexReport {
        self.index_workspace_with(root_uri, |_, _| {}).await
    }

    /// Like [`Indexer::index_workspace`], reporting each file as it finishes
    pub async fn index_workspace_with<F>(&self, root_uri: &str, mut on_file: F) -> IndexReport
    where
        F: FnMut(&str, &Result<IndexOutcome>),
    {
        let started = Instant::now();
        self.repo.begin_indexing();
        info!("Indexing workspace {}", root_uri);

        let mut report = IndexReport::default();
        let mut discovered = HashSet::new();
        let mut results = self
            .finder
            .find(root_uri, &self.config.include)
            .map(|uri| async move {
                let outcome = self.index_uri(&uri).await;
                (uri, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some((uri, outcome)) = results.next().await {
            on_file(&uri, &outcome);
            match &outcome {
                Ok(IndexOutcome::Indexed { .. }) => report.indexed += 1,
                Ok(IndexOutcome::Unchanged) => report.unchanged += 1,
                Ok(IndexOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!("Failed to index {}: {:#}", uri, e);
                    report.failed += 1;
                }
            }
            discovered.insert(uri);
        }
        drop(results);
        report.discovered = discovered.len();

        for uri in self.repo.uris() {
            if !discovered.contains(&uri) && !self.documents.is_open(&uri) && self.remove_uri(&uri).await {
                debug!("Removed stale file {}", uri);
                report.removed += 1;
            }
        }

        self.repo.mark_complete();
        report.elapsed = started.elapsed();
        info!(
            "Indexed {} files ({} unchanged, {} failed, {} removed) in {:?}",
            report.indexed, report.unchanged, report.failed, report.removed, report.elapsed
        );
        report
    }

    /// Reparse `uri` if its content hash changed. Writes for one URI are serialized.
    pub async fn index_uri(&self, uri: &str) -> Result<IndexOutcome> {
        if !self.provider.can_parse(uri) {
            return Ok(IndexOutcome::Skipped);
        }

        let lock = self.lock_for(uri);
        let _guard = lock.lock().await;

        // Read under the lock so the last writer sees the newest text
        let source = self.source(uri).await?;
        let hash = blake3::hash(source.text().as_bytes()).to_hex().to_string();
        if let Some(existing) = self.repo.get_file(uri) {
            if existing.content_hash == hash {
                self.repo.mark_verified(uri);
                return Ok(IndexOutcome::Unchanged);
            }
        }

        let provider = self.provider.clone();
        let owned_uri = uri.to_string();
        let file = tokio::task::spawn_blocking(move || -> Result<_> {
            let started = Instant::now();
            let tree = match &source {
                Source::Overlay(document) => document.tree_or_init(|text| provider.parse(&owned_uri, text))?,
                Source::Disk(text) => Arc::new(provider.parse(&owned_uri, text)?),
            };
            Ok(collector::collect(&tree, hash, started.elapsed()))
        })
        .await
        .map_err(|e| anyhow!("Indexing task for {} failed: {}", uri, e))??;

        let outcome = IndexOutcome::Indexed {
            definitions: file.definitions.len(),
            references: file.references.len(),
        };
        if file.has_errors {
            debug!("{} parsed with syntax errors", uri);
        }
        self.repo.upsert_file(file);
        for fqn in self.repo.conflicts(uri) {
            warn!("{} redeclares {}; keeping the first declaration", uri, fqn);
        }
        Ok(outcome)
    }

    /// Re-check a file restored from a snapshot before it is trusted
    pub async fn ensure_fresh(&self, uri: &str) {
        if self.repo.is_verified(uri) {
            return;
        }
        if let Err(e) = self.index_uri(uri).await {
            warn!("Dropping unverifiable file {}: {:#}", uri, e);
            self.remove_uri(uri).await;
        }
    }

    pub async fn remove_uri(&self, uri: &str) -> bool {
        let lock = self.lock_for(uri);
        let _guard = lock.lock().await;
        self.repo.remove_file(uri)
    }

    /// Syntax tree of the current text of `uri`, overlay first
    pub async fn load_tree(&self, uri: &str) -> Result<Arc<SyntaxTree>> {
        let source = self.source(uri).await?;
        let provider = self.provider.clone();
        let uri = uri.to_string();
        tokio::task::spawn_blocking(move || match source {
            Source::Overlay(document) => document.tree_or_init(|text| provider.parse(&uri, text)),
            Source::Disk(text) => provider.parse(&uri, &text).map(Arc::new),
        })
        .await
        .map_err(|e| anyhow!("Parse task failed: {}", e))?
    }

    /// Load a snapshot into the repository. Any failure leaves it empty.
    pub fn restore_snapshot(&self, store: &SnapshotStore) -> bool {
        match store.load() {
            Ok(snapshot) => {
                let files = self.repo.restore(snapshot);
                info!("Restored {} files from {}", files, store.path().display());
                files > 0
            }
            Err(SnapshotError::Missing(path)) => {
                debug!("No snapshot at {}", path.display());
                false
            }
            Err(e) => {
                warn!("Discarding snapshot {}: {}", store.path().display(), e);
                false
            }
        }
    }

    pub fn save_snapshot(&self, store: &SnapshotStore) -> Result<()> {
        store.save(&self.repo.snapshot())
    }
}
