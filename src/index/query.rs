// Lazy, chainable projections over the repository

use parking_lot::RwLockReadGuard;

use super::repository::IndexState;
use super::{Definition, File, Namespace, Reference, Symbol};

/// Read view over the whole repository.
///
/// Stages are plain iterators, so nothing is materialized until consumed:
/// `repo.query().filter(|f| f.uri == uri).symbols().collect::<Vec<_>>()`.
pub struct Query<'a> {
    state: RwLockReadGuard<'a, IndexState>,
}

impl<'a> Query<'a> {
    pub(crate) fn new(state: RwLockReadGuard<'a, IndexState>) -> Self {
        Self { state }
    }

    pub fn files(&self) -> FileRows<'_, impl Iterator<Item = &File>> {
        FileRows {
            state: &*self.state,
            rows: self.state.files.values().map(|(_, file)| file.as_ref()),
        }
    }

    pub fn filter<'s, P>(&'s self, predicate: P) -> FileRows<'s, impl Iterator<Item = &'s File>>
    where
        P: FnMut(&&'s File) -> bool,
    {
        self.files().filter(predicate)
    }

    pub fn namespaces(&self) -> NamespaceRows<impl Iterator<Item = &Namespace>> {
        self.files().namespaces()
    }

    pub fn symbols(&self) -> SymbolRows<impl Iterator<Item = &Symbol>> {
        self.files().symbols()
    }

    /// Live definitions only
    pub fn definitions(&self) -> DefinitionRows<impl Iterator<Item = &Definition>> {
        self.files().definitions()
    }

    pub fn references(&self) -> ReferenceRows<impl Iterator<Item = &Reference>> {
        self.files().references()
    }
}

/// File stage
pub struct FileRows<'q, I> {
    state: &'q IndexState,
    rows: I,
}

impl<'q, I> FileRows<'q, I>
where
    I: Iterator<Item = &'q File>,
{
    pub fn filter<P>(self, predicate: P) -> FileRows<'q, std::iter::Filter<I, P>>
    where
        P: FnMut(&&'q File) -> bool,
    {
        FileRows {
            state: self.state,
            rows: self.rows.filter(predicate),
        }
    }

    pub fn namespaces(self) -> NamespaceRows<impl Iterator<Item = &'q Namespace>> {
        NamespaceRows {
            rows: self.rows.flat_map(|file| file.namespaces.iter()),
        }
    }

    pub fn symbols(self) -> SymbolRows<impl Iterator<Item = &'q Symbol>> {
        self.namespaces().symbols()
    }

    pub fn definitions(self) -> DefinitionRows<impl Iterator<Item = &'q Definition>> {
        let state = self.state;
        DefinitionRows {
            rows: self
                .rows
                .flat_map(|file| file.definitions.iter())
                .filter(move |definition| state.is_live(definition)),
        }
    }

    pub fn references(self) -> ReferenceRows<impl Iterator<Item = &'q Reference>> {
        ReferenceRows {
            rows: self.rows.flat_map(|file| file.references.iter()),
        }
    }
}

impl<'q, I> Iterator for FileRows<'q, I>
where
    I: Iterator<Item = &'q File>,
{
    type Item = &'q File;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

macro_rules! leaf_stage {
    ($(#[$doc:meta])* $name:ident, $item:ty) => {
        $(#[$doc])*
        pub struct $name<I> {
            rows: I,
        }

        impl<'q, I> $name<I>
        where
            I: Iterator<Item = &'q $item>,
        {
            pub fn filter<P>(self, predicate: P) -> $name<std::iter::Filter<I, P>>
            where
                P: FnMut(&&'q $item) -> bool,
            {
                $name {
                    rows: self.rows.filter(predicate),
                }
            }
        }

        impl<'q, I> Iterator for $name<I>
        where
            I: Iterator<Item = &'q $item>,
        {
            type Item = &'q $item;

            fn next(&mut self) -> Option<Self::Item> {
                self.rows.next()
            }
        }
    };
}

leaf_stage!(
    /// Namespace stage
    NamespaceRows,
    Namespace
);
leaf_stage!(
    /// Symbol stage
    SymbolRows,
    Symbol
);
leaf_stage!(
    /// Definition stage, restricted to live definitions
    DefinitionRows,
    Definition
);
leaf_stage!(
    /// Reference stage
    ReferenceRows,
    Reference
);

impl<'q, I> NamespaceRows<I>
where
    I: Iterator<Item = &'q Namespace>,
{
    pub fn symbols(self) -> SymbolRows<impl Iterator<Item = &'q Symbol>> {
        SymbolRows {
            rows: self.rows.flat_map(|namespace| namespace.symbols.iter()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::index::{Definition, File, Namespace, Position, Range, Reference, Repository, Symbol, SymbolKind};

    fn file(uri: &str, namespace: &str, names: &[&str]) -> File {
        let qualify = |name: &str| format!("{}\\{}", namespace, name);
        File {
            uri: uri.to_string(),
            content_hash: "h".to_string(),
            parse_duration_ms: 0,
            has_errors: false,
            namespaces: vec![Namespace {
                name: namespace.to_string(),
                symbols: names
                    .iter()
                    .map(|name| Symbol {
                        name: name.to_string(),
                        kind: SymbolKind::Class,
                        fqn: qualify(name),
                        range: Range::default(),
                        namespace: namespace.to_string(),
                        container: None,
                    })
                    .collect(),
            }],
            definitions: names
                .iter()
                .map(|name| Definition {
                    fqn: qualify(name),
                    name: name.to_string(),
                    kind: SymbolKind::Class,
                    uri: uri.to_string(),
                    range: Range::new(Position::new(0, 0), Position::new(0, 1)),
                    container: None,
                    signature: None,
                    documentation: None,
                    parents: Vec::new(),
                })
                .collect(),
            references: vec![Reference {
                fqn: "Shared\\Thing".to_string(),
                uri: uri.to_string(),
                range: Range::default(),
                fallback: None,
            }],
        }
    }

    #[test]
    fn test_chained_projections() {
        let repo = Repository::new();
        repo.upsert_file(file("file:///a.php", "App", &["Alpha", "Beta"]));
        repo.upsert_file(file("file:///b.php", "Lib", &["Gamma"]));

        let query = repo.query();
        let mut names: Vec<&str> = query
            .filter(|f| f.uri == "file:///a.php")
            .symbols()
            .map(|s| s.name.as_str())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Alpha", "Beta"]);

        let lib: Vec<&str> = query
            .namespaces()
            .filter(|ns| ns.name == "Lib")
            .symbols()
            .map(|s| s.fqn.as_str())
            .collect();
        assert_eq!(lib, vec!["Lib\\Gamma"]);

        assert_eq!(query.references().count(), 2);
        assert_eq!(
            query
                .definitions()
                .filter(|d| d.name.starts_with('G'))
                .count(),
            1
        );
    }

    #[test]
    fn test_definitions_stage_hides_shadowed_duplicates() {
        let repo = Repository::new();
        repo.upsert_file(file("file:///a.php", "App", &["Dup"]));
        repo.upsert_file(file("file:///b.php", "App", &["Dup"]));

        let query = repo.query();
        let owners: Vec<&str> = query.definitions().map(|d| d.uri.as_str()).collect();
        assert_eq!(owners, vec!["file:///a.php"]);
        // both declarations are still symbols of their own files
        assert_eq!(query.symbols().count(), 2);
    }
}
