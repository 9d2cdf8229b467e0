// Editor-owned document overlays

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::syntax::SyntaxTree;

/// Text of an open document at one version
#[derive(Debug)]
pub struct Document {
    pub version: i32,
    pub text: Arc<str>,
    tree: OnceCell<Arc<SyntaxTree>>,
}

impl Document {
    fn new(version: i32, text: &str) -> Self {
        Self {
            version,
            text: Arc::from(text),
            tree: OnceCell::new(),
        }
    }

    /// Parse once per version
    pub fn tree_or_init<F>(&self, parse: F) -> anyhow::Result<Arc<SyntaxTree>>
    where
        F: FnOnce(&str) -> anyhow::Result<SyntaxTree>,
    {
        self.tree
            .get_or_try_init(|| parse(&self.text).map(Arc::new))
            .cloned()
    }
}

/// Open documents keyed by URI. Their text overrides what is on disk.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: DashMap<String, Arc<Document>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, uri: &str, version: i32, text: &str) {
        self.documents
            .insert(uri.to_string(), Arc::new(Document::new(version, text)));
    }

    /// Replace the text; returns false for a version older than the stored one
    pub fn update(&self, uri: &str, version: i32, text: &str) -> bool {
        let mut entry = self
            .documents
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(Document::new(version, text)));
        if version < entry.version {
            return false;
        }
        *entry = Arc::new(Document::new(version, text));
        true
    }

    pub fn close(&self, uri: &str) -> bool {
        self.documents.remove(uri).is_some()
    }

    pub fn get(&self, uri: &str) -> Option<Arc<Document>> {
        self.documents.get(uri).map(|entry| entry.value().clone())
    }

    pub fn is_open(&self, uri: &str) -> bool {
        self.documents.contains_key(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{PhpSyntaxProvider, SyntaxProvider};

    #[test]
    fn test_stale_versions_are_ignored() {
        let store = DocumentStore::new();
        store.open("file:///a.php", 1, "<?php // one");
        assert!(store.update("file:///a.php", 3, "<?php // three"));
        assert!(!store.update("file:///a.php", 2, "<?php // two"));

        let document = store.get("file:///a.php").unwrap();
        assert_eq!(document.version, 3);
        assert_eq!(&*document.text, "<?php // three");

        assert!(store.close("file:///a.php"));
        assert!(!store.is_open("file:///a.php"));
        assert!(!store.close("file:///a.php"));
    }

    #[test]
    fn test_tree_is_parsed_once_per_version() {
        let store = DocumentStore::new();
        store.open("file:///a.php", 1, "<?php class A {}");
        let document = store.get("file:///a.php").unwrap();

        let provider = PhpSyntaxProvider::new();
        let mut parses = 0;
        let first = document
            .tree_or_init(|text| {
                parses += 1;
                provider.parse("file:///a.php", text)
            })
            .unwrap();
        let second = document
            .tree_or_init(|text| {
                parses += 1;
                provider.parse("file:///a.php", text)
            })
            .unwrap();

        assert_eq!(parses, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
