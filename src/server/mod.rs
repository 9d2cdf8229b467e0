// Language server: lifecycle, document sync and request routing

pub mod dispatcher;
mod handlers;
pub mod package;
pub mod protocol;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lsp_types::{
    CompletionOptions, DidChangeTextDocumentParams, DidChangeWatchedFilesParams,
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, FileChangeType,
    HoverProviderCapability, InitializeParams, OneOf, ServerCapabilities,
    TextDocumentSyncCapability, TextDocumentSyncKind,
};
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use tokio::io::BufReader;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::index::snapshot::SnapshotStore;
use crate::index::Repository;
use crate::indexer::discovery::{path_to_uri, uri_to_path};
use crate::indexer::watcher::spawn_watcher;
use crate::indexer::Indexer;
use crate::resolver::DefinitionResolver;
use dispatcher::MessageHandler;
use package::PackageDescriptor;
use protocol::{parse_params, to_result, ResponseError};

/// Everything fixed by `initialize`
struct Workspace {
    indexer: Arc<Indexer>,
    config: Config,
    root: Option<PathBuf>,
    package: Option<PackageDescriptor>,
    snapshot: Option<SnapshotStore>,
}

pub struct LanguageServer {
    repo: Arc<Repository>,
    resolver: DefinitionResolver,
    /// Used when the client names no root
    defaults: Config,
    workspace: OnceCell<Workspace>,
    /// Claimed by the first `initialize` before any work starts
    initializing: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl LanguageServer {
    pub fn new(defaults: Config) -> Self {
        let repo = Arc::new(Repository::new());
        Self {
            resolver: DefinitionResolver::new(repo.clone()),
            repo,
            defaults,
            workspace: OnceCell::new(),
            initializing: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    async fn initialize(&self, params: InitializeParams) -> Result<Value, ResponseError> {
        if self.initializing.swap(true, Ordering::SeqCst) {
            return Err(ResponseError::invalid_request("Server is already initialized"));
        }

        let root = root_path(&params);
        let config = match &root {
            Some(root) => Config::from_project_dir(root),
            None => self.defaults.clone(),
        };
        let indexer = Arc::new(Indexer::new(self.repo.clone(), &config));

        let snapshot = match &root {
            Some(root) if config.cache.enabled => Some(SnapshotStore::new(config.cache_path(root))),
            _ => None,
        };
        if let Some(store) = snapshot.clone() {
            let indexer = indexer.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || indexer.restore_snapshot(&store)).await {
                self.initializing.store(false, Ordering::SeqCst);
                return Err(ResponseError::internal(format!("Snapshot restore failed: {}", e)));
            }
        }

        let workspace = Workspace {
            indexer: indexer.clone(),
            config: config.clone(),
            root: root.clone(),
            package: root.as_deref().and_then(PackageDescriptor::load),
            snapshot,
        };
        if self.workspace.set(workspace).is_err() {
            return Err(ResponseError::invalid_request("Server is already initialized"));
        }

        match root.as_deref().and_then(|path| path_to_uri(path).map(|uri| (path, uri))) {
            Some((path, root_uri)) => {
                info!("Workspace root {}", path.display());
                self.repo.begin_indexing();
                let sweep = indexer.clone();
                tokio::spawn(async move {
                    sweep.index_workspace(&root_uri).await;
                });
                if config.indexing.watch {
                    spawn_watcher(indexer, path.to_path_buf(), config.indexing.exclude.clone());
                }
            }
            None => {
                info!("No workspace root, serving open documents only");
                self.repo.mark_complete();
            }
        }

        to_result(json!({
            "capabilities": capabilities(),
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        }))
    }

    async fn shutdown(&self, workspace: &Workspace) -> Result<Value, ResponseError> {
        info!("Received shutdown request");
        self.shutdown_requested.store(true, Ordering::SeqCst);

        if let Some(store) = workspace.snapshot.clone() {
            let indexer = workspace.indexer.clone();
            match tokio::task::spawn_blocking(move || indexer.save_snapshot(&store)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to save snapshot: {:#}", e),
                Err(e) => warn!("Snapshot task failed: {}", e),
            }
        }
        Ok(Value::Null)
    }

    async fn did_open(&self, workspace: &Workspace, params: DidOpenTextDocumentParams) {
        let document = params.text_document;
        let uri = document.uri.to_string();
        workspace
            .indexer
            .documents()
            .open(&uri, document.version, &document.text);
        reindex(workspace, &uri).await;
    }

    async fn did_change(&self, workspace: &Workspace, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri.to_string();
        // Full sync: the last change carries the whole text
        let Some(change) = params.content_changes.into_iter().last() else {
            return;
        };
        if workspace
            .indexer
            .documents()
            .update(&uri, params.text_document.version, &change.text)
        {
            reindex(workspace, &uri).await;
        } else {
            debug!("Ignoring stale change to {}", uri);
        }
    }

    async fn did_close(&self, workspace: &Workspace, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri.to_string();
        workspace.indexer.documents().close(&uri);
        if uri_to_path(&uri).is_some_and(|path| path.is_file()) {
            reindex(workspace, &uri).await;
        } else {
            workspace.indexer.remove_uri(&uri).await;
        }
    }

    async fn did_change_watched_files(&self, workspace: &Workspace, params: DidChangeWatchedFilesParams) {
        for change in params.changes {
            let uri = change.uri.to_string();
            if workspace.indexer.documents().is_open(&uri) {
                continue;
            }
            if change.typ == FileChangeType::DELETED {
                workspace.indexer.remove_uri(&uri).await;
            } else {
                reindex(workspace, &uri).await;
            }
        }
    }
}

async fn reindex(workspace: &Workspace, uri: &str) {
    match workspace.indexer.index_uri(uri).await {
        Ok(outcome) => debug!("Reindexed {}: {:?}", uri, outcome),
        Err(e) => warn!("Failed to index {}: {:#}", uri, e),
    }
}

#[allow(deprecated)]
fn root_path(params: &InitializeParams) -> Option<PathBuf> {
    params
        .root_uri
        .as_ref()
        .or_else(|| params.workspace_folders.as_ref()?.first().map(|folder| &folder.uri))
        .and_then(|uri| uri.to_file_path().ok())
}

fn capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL)),
        document_symbol_provider: Some(OneOf::Left(true)),
        definition_provider: Some(OneOf::Left(true)),
        references_provider: Some(OneOf::Left(true)),
        hover_provider: Some(HoverProviderCapability::Simple(true)),
        completion_provider: Some(CompletionOptions {
            trigger_characters: Some(vec![">".to_string(), ":".to_string(), "\\".to_string()]),
            ..Default::default()
        }),
        experimental: Some(json!({ "xdefinitionProvider": true })),
        ..Default::default()
    }
}

#[async_trait]
impl MessageHandler for LanguageServer {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, ResponseError> {
        if method == "initialize" {
            return self.initialize(parse_params(params)?).await;
        }
        let Some(workspace) = self.workspace.get() else {
            return Err(ResponseError::not_initialized());
        };
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Err(ResponseError::invalid_request("Server is shutting down"));
        }

        match method {
            "shutdown" => self.shutdown(workspace).await,
            "textDocument/documentSymbol" => self.document_symbol(workspace, parse_params(params)?).await,
            "textDocument/definition" => self.definition(workspace, parse_params(params)?).await,
            "textDocument/references" => self.references(workspace, parse_params(params)?).await,
            "textDocument/hover" => self.hover(workspace, parse_params(params)?).await,
            "textDocument/completion" => self.completion(workspace, parse_params(params)?).await,
            "textDocument/xdefinition" => self.xdefinition(workspace, parse_params(params)?).await,
            other => Err(ResponseError::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) -> Result<()> {
        if method.starts_with("$/") {
            return Ok(());
        }
        let Some(workspace) = self.workspace.get() else {
            debug!("Dropping {} before initialize", method);
            return Ok(());
        };

        match method {
            "initialized" => {}
            "textDocument/didOpen" => self.did_open(workspace, serde_json::from_value(params)?).await,
            "textDocument/didChange" => self.did_change(workspace, serde_json::from_value(params)?).await,
            "textDocument/didClose" => self.did_close(workspace, serde_json::from_value(params)?).await,
            "workspace/didChangeWatchedFiles" => {
                self.did_change_watched_files(workspace, serde_json::from_value(params)?)
                    .await
            }
            other => debug!("Unhandled notification {}", other),
        }
        Ok(())
    }

    fn exit_code(&self) -> i32 {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            0
        } else {
            1
        }
    }
}

/// Serve on stdin/stdout; returns the process exit status
pub async fn serve_stdio(defaults: Config) -> Result<i32> {
    let server = Arc::new(LanguageServer::new(defaults));
    dispatcher::run(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), server).await
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::Path;

    pub(crate) fn initialize_params(root: Option<&Path>) -> Value {
        let root_uri = root.and_then(path_to_uri);
        json!({
            "processId": null,
            "rootUri": root_uri,
            "capabilities": {}
        })
    }

    /// Initialized server whose initial sweep has finished
    pub(crate) async fn indexed_server(root: &Path) -> LanguageServer {
        let server = LanguageServer::new(Config::default());
        server
            .handle_request("initialize", initialize_params(Some(root)))
            .await
            .unwrap();
        server.resolver.wait_for_complete().await;
        server
    }
}
