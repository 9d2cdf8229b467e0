// File discovery and content retrieval services

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use globset::{GlobBuilder, GlobMatcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;
use walkdir::WalkDir;

use crate::config::matches_pattern;

/// Lazily lists the URIs under a root that match a glob
pub trait FileFinder: Send + Sync {
    fn find(&self, root_uri: &str, glob: &str) -> BoxStream<'static, String>;
}

/// Reads the current text of a URI
#[async_trait]
pub trait ContentRetriever: Send + Sync {
    async fn retrieve(&self, uri: &str) -> Result<String>;
}

/// Walks the local file system on a blocking thread
#[derive(Debug, Clone, Default)]
pub struct WalkdirFinder {
    exclude: Vec<String>,
}

impl WalkdirFinder {
    pub fn new(exclude: Vec<String>) -> Self {
        Self { exclude }
    }
}

impl FileFinder for WalkdirFinder {
    fn find(&self, root_uri: &str, glob: &str) -> BoxStream<'static, String> {
        let Some(root) = uri_to_path(root_uri) else {
            warn!("Cannot discover files under non-file URI {}", root_uri);
            return stream::empty().boxed();
        };
        let pattern = match compile_glob(glob) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!("Invalid glob {:?}: {}", glob, e);
                return stream::empty().boxed();
            }
        };
        let exclude = self.exclude.clone();

        let (tx, rx) = mpsc::channel(256);
        tokio::task::spawn_blocking(move || walk(&root, &pattern, &exclude, &tx));

        stream::unfold(rx, |mut rx| async move {
            let uri = rx.recv().await?;
            Some((uri, rx))
        })
        .boxed()
    }
}

fn walk(root: &Path, pattern: &GlobMatcher, exclude: &[String], tx: &mpsc::Sender<String>) {
    let relative = |path: &Path| -> String {
        path.strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    };

    let entries = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let mut path = relative(entry.path());
            if entry.file_type().is_dir() {
                path.push('/');
            }
            !exclude.iter().any(|pattern| matches_pattern(&path, pattern))
        });

    let mut found = 0usize;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !pattern.is_match(&relative(entry.path())) {
            continue;
        }
        if let Some(uri) = path_to_uri(entry.path()) {
            found += 1;
            // Receiver dropped: nobody is listening any more
            if tx.blocking_send(uri).is_err() {
                return;
            }
        }
    }
    debug!("Discovered {} files under {}", found, root.display());
}

/// Reads from disk with `tokio::fs`, replacing invalid UTF-8
#[derive(Debug, Clone, Copy, Default)]
pub struct FsContentRetriever;

#[async_trait]
impl ContentRetriever for FsContentRetriever {
    async fn retrieve(&self, uri: &str) -> Result<String> {
        let path = uri_to_path(uri).with_context(|| format!("Not a file URI: {}", uri))?;
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }
}

/// Compile a path glob (`*`, `**`, `?`, `[ab]`, `{a,b}`); `*` stops at `/`
pub fn compile_glob(glob: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(glob)
        .literal_separator(true)
        .build()
        .with_context(|| format!("Invalid glob: {}", glob))?;
    Ok(glob.compile_matcher())
}

pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok()?.to_file_path().ok()
}

pub fn path_to_uri(path: &Path) -> Option<String> {
    Url::from_file_path(path).ok().map(String::from)
}
