// Read-only query handlers

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use lsp_types::{
    CompletionItem, CompletionItemKind, CompletionList, CompletionParams, CompletionResponse,
    DocumentSymbolParams, GotoDefinitionParams, Hover, HoverContents, HoverParams, Location,
    MarkupContent, MarkupKind, ReferenceParams, SymbolInformation, TextDocumentPositionParams,
};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use super::protocol::{to_result, ResponseError};
use super::{LanguageServer, Workspace};
use crate::index::{Definition, Position, Range, SymbolKind};
use crate::resolver::names::{class_fqn, enclosing_class};
use crate::resolver::{candidate_fqns, name_range_node, target_node, NameContext};
use crate::syntax::{NodeId, SyntaxTree};

/// Where a completion applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionScope {
    Global,
    /// After `$this->`
    Instance,
    /// After `self::` or `static::`
    Static,
    /// After `parent::`
    Parent,
    /// After a receiver whose type is unknown
    None,
}

impl LanguageServer {
    pub(super) async fn document_symbol(
        &self,
        workspace: &Workspace,
        params: DocumentSymbolParams,
    ) -> Result<Value, ResponseError> {
        let uri = params.text_document.uri;
        let key = uri.to_string();
        workspace.indexer.ensure_fresh(&key).await;
        if !self.repo.contains(&key) {
            if let Err(e) = workspace.indexer.index_uri(&key).await {
                debug!("Cannot index {} for symbols: {:#}", key, e);
            }
        }

        let query = self.repo.query();
        #[allow(deprecated)]
        let symbols: Vec<SymbolInformation> = query
            .filter(|file| file.uri == key)
            .symbols()
            .map(|symbol| SymbolInformation {
                name: symbol.name.clone(),
                kind: symbol.kind.to_lsp(),
                tags: None,
                deprecated: None,
                location: Location::new(uri.clone(), symbol.range.into()),
                container_name: symbol
                    .container
                    .clone()
                    .or_else(|| (!symbol.namespace.is_empty()).then(|| symbol.namespace.clone())),
            })
            .collect();
        to_result(symbols)
    }

    pub(super) async fn definition(
        &self,
        workspace: &Workspace,
        params: GotoDefinitionParams,
    ) -> Result<Value, ResponseError> {
        let Some((tree, target)) = self.target_at(workspace, &params.text_document_position_params).await else {
            return to_result(Vec::<Location>::new());
        };
        let locations: Vec<Location> = self
            .resolve(workspace, &tree, target)
            .await
            .as_ref()
            .and_then(location)
            .into_iter()
            .collect();
        to_result(locations)
    }

    pub(super) async fn references(
        &self,
        workspace: &Workspace,
        params: ReferenceParams,
    ) -> Result<Value, ResponseError> {
        let Some((tree, target)) = self.target_at(workspace, &params.text_document_position).await else {
            return to_result(Vec::<Location>::new());
        };
        let candidates = candidate_fqns(&tree, target);
        if candidates.is_empty() {
            return to_result(Vec::<Location>::new());
        }

        // References are only trustworthy once every file has been seen
        self.resolver.wait_for_complete().await;
        let definition = self.resolver.lookup(&candidates);
        let fqn = match &definition {
            Some(definition) => definition.fqn.clone(),
            None => candidates[0].clone(),
        };

        let uris = self.repo.get_reference_uris(&fqn);
        join_all(uris.iter().map(|uri| workspace.indexer.ensure_fresh(uri))).await;

        let mut found: Vec<(String, Range)> = self
            .repo
            .references_to(&fqn)
            .into_iter()
            .map(|reference| (reference.uri, reference.range))
            .collect();
        if params.context.include_declaration {
            if let Some(definition) = &definition {
                found.push((definition.uri.clone(), definition.range));
            }
        }
        found.sort_by(|a, b| (&a.0, a.1.start).cmp(&(&b.0, b.1.start)));
        found.dedup_by(|a, b| a.0 == b.0 && a.1.start == b.1.start);

        let locations: Vec<Location> = found
            .into_iter()
            .filter_map(|(uri, range)| match Url::parse(&uri) {
                Ok(uri) => Some(Location::new(uri, range.into())),
                Err(e) => {
                    warn!("Skipping reference with bad URI {}: {}", uri, e);
                    None
                }
            })
            .collect();
        to_result(locations)
    }

    pub(super) async fn hover(&self, workspace: &Workspace, params: HoverParams) -> Result<Value, ResponseError> {
        let Some((tree, target)) = self.target_at(workspace, &params.text_document_position_params).await else {
            return Ok(Value::Null);
        };
        let Some(definition) = self.resolve(workspace, &tree, target).await else {
            return Ok(Value::Null);
        };

        let header = definition.signature.as_deref().unwrap_or(&definition.fqn);
        let mut value = format!("```php\n{}\n```", header);
        if let Some(documentation) = definition.documentation.as_deref().filter(|doc| !doc.is_empty()) {
            value.push_str("\n\n");
            value.push_str(documentation);
        }
        to_result(Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value,
            }),
            range: Some(tree.range(name_range_node(&tree, target)).into()),
        })
    }

    pub(super) async fn completion(
        &self,
        workspace: &Workspace,
        params: CompletionParams,
    ) -> Result<Value, ResponseError> {
        let position = &params.text_document_position;
        let uri = position.text_document.uri.to_string();
        let tree = match workspace.indexer.load_tree(&uri).await {
            Ok(tree) => tree,
            Err(e) => {
                debug!("No completion source for {}: {:#}", uri, e);
                return to_result(CompletionResponse::List(CompletionList::default()));
            }
        };
        let cursor = Position::from(position.position);
        let Some(offset) = tree.offset_at(cursor) else {
            return to_result(CompletionResponse::List(CompletionList::default()));
        };
        let before = tree.source().get(..offset).unwrap_or_default();
        let line = before.rsplit('\n').next().unwrap_or_default();
        let (scope, prefix) = completion_context(line);

        let mut items = match scope {
            CompletionScope::Global if !prefix.is_empty() => self.global_completions(prefix),
            CompletionScope::Global | CompletionScope::None => Vec::new(),
            member_scope => match current_class(&tree, cursor) {
                Some(class) => self.member_completions(&class, member_scope, prefix),
                None => Vec::new(),
            },
        };

        items.sort_by(|a, b| a.label.cmp(&b.label));
        items.dedup_by(|a, b| a.label == b.label);
        let limit = workspace.config.query.completion_limit;
        let truncated = items.len() > limit;
        items.truncate(limit);

        to_result(CompletionResponse::List(CompletionList {
            is_incomplete: truncated || !self.repo.is_complete(),
            items,
        }))
    }

    pub(super) async fn xdefinition(
        &self,
        workspace: &Workspace,
        params: TextDocumentPositionParams,
    ) -> Result<Value, ResponseError> {
        let Some((tree, target)) = self.target_at(workspace, &params).await else {
            return Ok(json!([]));
        };
        let Some(definition) = self.resolve(workspace, &tree, target).await else {
            return Ok(json!([]));
        };
        let Some(location) = location(&definition) else {
            return Ok(json!([]));
        };

        Ok(json!([{
            "symbol": {
                "fqsen": definition.fqn,
                "name": definition.name,
                "kind": definition.kind.to_lsp(),
                "containerName": definition.container,
                "package": workspace.package,
            },
            "location": location,
        }]))
    }

    /// Node a positional request is about, in the current text of its file
    async fn target_at(
        &self,
        workspace: &Workspace,
        params: &TextDocumentPositionParams,
    ) -> Option<(Arc<SyntaxTree>, NodeId)> {
        let uri = params.text_document.uri.to_string();
        workspace.indexer.ensure_fresh(&uri).await;
        let tree = match workspace.indexer.load_tree(&uri).await {
            Ok(tree) => tree,
            Err(e) => {
                debug!("Cannot load {}: {:#}", uri, e);
                return None;
            }
        };
        let leaf = tree.node_at(params.position.into())?;
        let target = target_node(&tree, leaf);
        Some((tree, target))
    }

    /// Resolve, re-checking the owning file once if it came from a snapshot
    async fn resolve(&self, workspace: &Workspace, tree: &SyntaxTree, target: NodeId) -> Option<Definition> {
        let definition = self.resolver.resolve_to_definition(tree, target).await?;
        if self.repo.is_verified(&definition.uri) {
            return Some(definition);
        }
        workspace.indexer.ensure_fresh(&definition.uri).await;
        self.resolver.resolve_to_definition(tree, target).await
    }

    fn global_completions(&self, prefix: &str) -> Vec<CompletionItem> {
        let prefix = prefix.to_lowercase();
        let query = self.repo.query();
        query
            .definitions()
            .filter(|definition| !definition.kind.is_member())
            .filter(|definition| definition.name.to_lowercase().starts_with(&prefix))
            .map(|definition| completion_item(definition.name.clone(), definition))
            .collect()
    }

    /// Members of `class` and its ancestors, nearest declaration first
    fn member_completions(&self, class: &str, scope: CompletionScope, prefix: &str) -> Vec<CompletionItem> {
        let mut queue: VecDeque<String> = match scope {
            CompletionScope::Parent => self
                .repo
                .get_definition(class)
                .map(|definition| definition.parents.into())
                .unwrap_or_default(),
            _ => VecDeque::from([class.to_string()]),
        };
        let mut seen = HashSet::new();
        let mut owners = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(definition) = self.repo.get_definition(&current) {
                queue.extend(definition.parents.iter().cloned());
            }
            owners.push(current);
        }

        let instance = scope == CompletionScope::Instance;
        let query = self.repo.query();
        let mut items = Vec::new();
        for owner in &owners {
            let members = query
                .definitions()
                .filter(|definition| definition.container.as_deref() == Some(owner.as_str()));
            for definition in members {
                let static_property = definition.fqn.contains("::$");
                let label = match definition.kind {
                    SymbolKind::Method => definition.name.clone(),
                    SymbolKind::Property if instance && !static_property => definition.name.clone(),
                    SymbolKind::Property if !instance && static_property => format!("${}", definition.name),
                    SymbolKind::ClassConstant | SymbolKind::EnumCase if !instance => definition.name.clone(),
                    _ => continue,
                };
                if label.trim_start_matches('$').starts_with(prefix) || label.starts_with(prefix) {
                    items.push(completion_item(label, definition));
                }
            }
        }
        // Stable sort keeps the nearest owner first for equal labels
        items.sort_by(|a, b| a.label.cmp(&b.label));
        items.dedup_by(|a, b| a.label == b.label);
        items
    }
}

fn location(definition: &Definition) -> Option<Location> {
    match Url::parse(&definition.uri) {
        Ok(uri) => Some(Location::new(uri, definition.range.into())),
        Err(e) => {
            warn!("Definition {} has a bad URI {}: {}", definition.fqn, definition.uri, e);
            None
        }
    }
}

fn current_class(tree: &SyntaxTree, cursor: Position) -> Option<String> {
    let node = tree.node_at(cursor)?;
    let class = enclosing_class(tree, node)?;
    class_fqn(tree, class, &NameContext::for_node(tree, class))
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || !c.is_ascii()
}

/// Scope and identifier prefix from the line text before the cursor
fn completion_context(line: &str) -> (CompletionScope, &str) {
    let start = line
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_identifier_char(*c))
        .last()
        .map(|(at, _)| at)
        .unwrap_or(line.len());
    let prefix = &line[start..];
    let head = &line[..start];

    if let Some(receiver) = head.strip_suffix("->") {
        let scope = if receiver.ends_with("$this") {
            CompletionScope::Instance
        } else {
            CompletionScope::None
        };
        return (scope, prefix);
    }

    let head = head.strip_suffix('$').unwrap_or(head);
    if let Some(scope) = head.strip_suffix("::") {
        let word_start = scope
            .char_indices()
            .rev()
            .take_while(|(_, c)| is_identifier_char(*c))
            .last()
            .map(|(at, _)| at)
            .unwrap_or(scope.len());
        let scope = match scope[word_start..].to_ascii_lowercase().as_str() {
            "self" | "static" => CompletionScope::Static,
            "parent" => CompletionScope::Parent,
            _ => CompletionScope::None,
        };
        return (scope, prefix);
    }
    (CompletionScope::Global, prefix)
}

fn completion_item(label: String, definition: &Definition) -> CompletionItem {
    let kind = match definition.kind {
        SymbolKind::Class | SymbolKind::Trait => CompletionItemKind::CLASS,
        SymbolKind::Interface => CompletionItemKind::INTERFACE,
        SymbolKind::Enum => CompletionItemKind::ENUM,
        SymbolKind::EnumCase => CompletionItemKind::ENUM_MEMBER,
        SymbolKind::Function => CompletionItemKind::FUNCTION,
        SymbolKind::Method => CompletionItemKind::METHOD,
        SymbolKind::Property => CompletionItemKind::PROPERTY,
        SymbolKind::ClassConstant | SymbolKind::Constant => CompletionItemKind::CONSTANT,
    };
    CompletionItem {
        label,
        kind: Some(kind),
        detail: Some(definition.signature.clone().unwrap_or_else(|| definition.fqn.clone())),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::super::dispatcher::MessageHandler;
    use super::super::testing::indexed_server;
    use super::*;
    use crate::indexer::discovery::path_to_uri;
    use tempfile::TempDir;

    const A: &str = "<?php\nnamespace App;\n\n/** A greeter. */\nclass Foo\n{\n    public function greet() {}\n\n    public function go()\n    {\n        $this->gr;\n    }\n}\n";
    const B: &str = "<?php\nnamespace App;\n\n$foo = new Foo();\n$foo->greet();\nhelper();\nnew Fo;\n";

    fn project() -> (TempDir, String, String) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.php"), A).unwrap();
        std::fs::write(dir.path().join("b.php"), B).unwrap();
        std::fs::write(dir.path().join("composer.json"), r#"{"name": "acme/app"}"#).unwrap();
        let a = path_to_uri(&dir.path().join("a.php")).unwrap();
        let b = path_to_uri(&dir.path().join("b.php")).unwrap();
        (dir, a, b)
    }

    fn at(uri: &str, line: u32, character: u32) -> Value {
        json!({
            "textDocument": {"uri": uri},
            "position": {"line": line, "character": character}
        })
    }

    #[tokio::test]
    async fn test_document_symbol_lists_declarations() {
        let (dir, a, _) = project();
        let server = indexed_server(dir.path()).await;

        let result = server
            .handle_request("textDocument/documentSymbol", json!({"textDocument": {"uri": a}}))
            .await
            .unwrap();
        let symbols = result.as_array().unwrap();
        let foo: Vec<&Value> = symbols.iter().filter(|s| s["name"] == json!("Foo")).collect();
        assert_eq!(foo.len(), 1);
        assert_eq!(foo[0]["location"]["range"]["start"]["line"], json!(4));
        assert_eq!(foo[0]["containerName"], json!("App"));

        let greet = symbols.iter().find(|s| s["name"] == json!("greet")).unwrap();
        assert_eq!(greet["containerName"], json!("App\\Foo"));
    }

    #[tokio::test]
    async fn test_definition_across_files() {
        let (dir, a, b) = project();
        let server = indexed_server(dir.path()).await;

        let result = server
            .handle_request("textDocument/definition", at(&b, 3, 12))
            .await
            .unwrap();
        assert_eq!(result.as_array().unwrap().len(), 1);
        assert_eq!(result[0]["uri"], json!(a));
        assert_eq!(result[0]["range"]["start"]["line"], json!(4));

        // `helper()` is declared nowhere
        let result = server
            .handle_request("textDocument/definition", at(&b, 5, 2))
            .await
            .unwrap();
        assert_eq!(result, json!([]));
    }

    #[tokio::test]
    async fn test_references_honour_include_declaration() {
        let (dir, a, b) = project();
        let server = indexed_server(dir.path()).await;

        let mut params = at(&a, 4, 7);
        params["context"] = json!({"includeDeclaration": true});
        let result = server
            .handle_request("textDocument/references", params.clone())
            .await
            .unwrap();
        let uris: Vec<&Value> = result.as_array().unwrap().iter().map(|l| &l["uri"]).collect();
        assert_eq!(uris.len(), 2);
        assert!(uris.contains(&&json!(a)));
        assert!(uris.contains(&&json!(b)));

        params["context"] = json!({"includeDeclaration": false});
        let result = server
            .handle_request("textDocument/references", params)
            .await
            .unwrap();
        assert_eq!(result.as_array().unwrap().len(), 1);
        assert_eq!(result[0]["uri"], json!(b));
        assert_eq!(result[0]["range"]["start"]["line"], json!(3));
    }

    #[tokio::test]
    async fn test_unqualified_call_belongs_to_namespaced_function() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("global.php"), "<?php\nfunction helper() {}\n").unwrap();
        std::fs::write(dir.path().join("app.php"), "<?php\nnamespace App;\nfunction helper() {}\n").unwrap();
        std::fs::write(dir.path().join("call.php"), "<?php\nnamespace App;\nhelper();\n").unwrap();
        let global = path_to_uri(&dir.path().join("global.php")).unwrap();
        let app = path_to_uri(&dir.path().join("app.php")).unwrap();
        let call = path_to_uri(&dir.path().join("call.php")).unwrap();
        let server = indexed_server(dir.path()).await;

        let mut params = at(&global, 1, 10);
        params["context"] = json!({"includeDeclaration": false});
        let result = server
            .handle_request("textDocument/references", params)
            .await
            .unwrap();
        assert_eq!(result, json!([]));
        assert!(server.repo.get_reference_uris("helper()").is_empty());

        let mut params = at(&app, 2, 10);
        params["context"] = json!({"includeDeclaration": false});
        let result = server
            .handle_request("textDocument/references", params)
            .await
            .unwrap();
        assert_eq!(result.as_array().unwrap().len(), 1);
        assert_eq!(result[0]["uri"], json!(call));
        assert_eq!(result[0]["range"]["start"], json!({"line": 2, "character": 0}));
    }

    #[tokio::test]
    async fn test_hover_shows_signature_and_docs() {
        let (dir, _, b) = project();
        let server = indexed_server(dir.path()).await;

        let result = server
            .handle_request("textDocument/hover", at(&b, 3, 12))
            .await
            .unwrap();
        let value = result["contents"]["value"].as_str().unwrap();
        assert!(value.contains("```php\nclass Foo"));
        assert!(value.contains("A greeter."));
        assert_eq!(result["range"]["start"], json!({"line": 3, "character": 11}));

        let nothing = server
            .handle_request("textDocument/hover", at(&b, 2, 0))
            .await
            .unwrap();
        assert_eq!(nothing, Value::Null);
    }

    #[tokio::test]
    async fn test_completion_global_and_members() {
        let (dir, a, b) = project();
        let server = indexed_server(dir.path()).await;

        let result = server
            .handle_request("textDocument/completion", at(&b, 6, 6))
            .await
            .unwrap();
        assert_eq!(result["isIncomplete"], json!(false));
        let labels: Vec<&str> = result["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["label"].as_str().unwrap())
            .collect();
        assert!(labels.contains(&"Foo"));

        let result = server
            .handle_request("textDocument/completion", at(&a, 10, 17))
            .await
            .unwrap();
        let labels: Vec<&str> = result["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["label"].as_str().unwrap())
            .collect();
        assert_eq!(labels, vec!["greet"]);
    }

    #[tokio::test]
    async fn test_xdefinition_carries_package() {
        let (dir, a, b) = project();
        let server = indexed_server(dir.path()).await;

        let result = server
            .handle_request("textDocument/xdefinition", at(&b, 3, 12))
            .await
            .unwrap();
        assert_eq!(result[0]["symbol"]["fqsen"], json!("App\\Foo"));
        assert_eq!(result[0]["symbol"]["name"], json!("Foo"));
        assert_eq!(result[0]["symbol"]["package"]["name"], json!("acme/app"));
        assert_eq!(result[0]["location"]["uri"], json!(a));
    }

    #[test]
    fn test_completion_context() {
        assert_eq!(completion_context("    new Fo"), (CompletionScope::Global, "Fo"));
        assert_eq!(completion_context("$this->gr"), (CompletionScope::Instance, "gr"));
        assert_eq!(completion_context("$user->na"), (CompletionScope::None, "na"));
        assert_eq!(completion_context("return self::"), (CompletionScope::Static, ""));
        assert_eq!(completion_context("static::$cou"), (CompletionScope::Static, "cou"));
        assert_eq!(completion_context("parent::bo"), (CompletionScope::Parent, "bo"));
        assert_eq!(completion_context("Other::X"), (CompletionScope::None, "X"));
        assert_eq!(completion_context(""), (CompletionScope::Global, ""));
    }
}
