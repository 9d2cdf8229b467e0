// Namespace and import context for PHP name resolution

use std::collections::HashMap;

use crate::syntax::{Field, ImportKind, NodeId, NodeKind, SyntaxTree};

/// The namespace block a node belongs to. `None` is the implicit global block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region(pub Option<NodeId>);

impl Region {
    pub fn of(tree: &SyntaxTree, node: NodeId) -> Self {
        if tree.kind(node) == NodeKind::NamespaceDefinition {
            return Region(Some(node));
        }

        let mut top = node;
        for ancestor in tree.ancestors(node) {
            if tree.kind(ancestor) == NodeKind::NamespaceDefinition {
                return Region(Some(ancestor));
            }
            if tree.parent(ancestor).is_some() {
                top = ancestor;
            }
        }
        if top == tree.root() {
            return Region(None);
        }

        // `namespace Foo;` without braces governs the statements after it
        let preceding = tree
            .children(tree.root())
            .take_while(|child| *child != top)
            .filter(|child| tree.kind(*child) == NodeKind::NamespaceDefinition)
            .last();
        Region(preceding)
    }
}

/// Imports and current namespace in effect at one point of a file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameContext {
    pub namespace: String,
    classes: HashMap<String, String>,
    functions: HashMap<String, String>,
    constants: HashMap<String, String>,
}

impl NameContext {
    pub fn for_node(tree: &SyntaxTree, node: NodeId) -> Self {
        Self::for_region(tree, Region::of(tree, node))
    }

    pub fn for_region(tree: &SyntaxTree, region: Region) -> Self {
        let mut context = NameContext::default();
        let root = tree.root();

        let statements: Vec<NodeId> = match region.0 {
            Some(definition) => {
                context.namespace = tree
                    .child_by_field(definition, Field::Name)
                    .map(|name| tree.text(name).trim_start_matches('\\').to_string())
                    .unwrap_or_default();
                match tree.child_by_field(definition, Field::Body) {
                    Some(body) => tree.children(body).collect(),
                    None => tree
                        .children(root)
                        .skip_while(|child| *child != definition)
                        .skip(1)
                        .take_while(|child| tree.kind(*child) != NodeKind::NamespaceDefinition)
                        .collect(),
                }
            }
            None => tree
                .children(root)
                .take_while(|child| tree.kind(*child) != NodeKind::NamespaceDefinition)
                .collect(),
        };

        for statement in statements {
            if let NodeKind::UseDeclaration(kind) = tree.kind(statement) {
                context.add_use_declaration(tree, statement, kind);
            }
        }
        context
    }

    fn add_use_declaration(&mut self, tree: &SyntaxTree, declaration: NodeId, kind: ImportKind) {
        let group = tree.child_of_kind(declaration, NodeKind::UseGroup);
        let prefix = group.and_then(|_| {
            tree.name_child(declaration)
                .map(|name| tree.text(name).trim_matches('\\').to_string())
        });

        let clauses = tree
            .children(declaration)
            .chain(group.into_iter().flat_map(|group| tree.children(group)))
            .filter(|child| matches!(tree.kind(*child), NodeKind::UseClause(_)));

        for clause in clauses {
            let Some((kind, target)) = import_of_clause(tree, clause, kind, prefix.as_deref())
            else {
                continue;
            };
            let alias = clause_alias(tree, clause)
                .unwrap_or_else(|| last_segment(&target).to_string());
            match kind {
                ImportKind::Class => self.classes.insert(alias.to_lowercase(), target),
                ImportKind::Function => self.functions.insert(alias.to_lowercase(), target),
                ImportKind::Constant => self.constants.insert(alias, target),
            };
        }
    }

    /// Prefix a name with the current namespace
    pub fn qualify(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}\\{}", self.namespace, name)
        }
    }

    /// Resolve a class-like name. `self`, `static` and `parent` are the caller's job.
    pub fn resolve_class(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() || is_relative_scope(raw) {
            return None;
        }
        if let Some(absolute) = raw.strip_prefix('\\') {
            return Some(absolute.to_string());
        }
        if let Some(relative) = strip_namespace_keyword(raw) {
            return Some(self.qualify(relative));
        }

        let (first, rest) = match raw.split_once('\\') {
            Some((first, rest)) => (first, Some(rest)),
            None => (raw, None),
        };
        if let Some(target) = self.classes.get(&first.to_lowercase()) {
            return Some(match rest {
                Some(rest) => format!("{}\\{}", target, rest),
                None => target.clone(),
            });
        }
        Some(self.qualify(raw))
    }

    /// Candidate FQNs of a called function, namespaced first, then the global fallback
    pub fn resolve_function(&self, raw: &str) -> Vec<String> {
        self.resolve_callable(raw, &self.functions, true)
            .into_iter()
            .map(|name| format!("{}()", name))
            .collect()
    }

    /// Candidate FQNs of a constant usage
    pub fn resolve_constant(&self, raw: &str) -> Vec<String> {
        if matches!(raw.to_lowercase().as_str(), "true" | "false" | "null") {
            return Vec::new();
        }
        self.resolve_callable(raw, &self.constants, false)
    }

    fn resolve_callable(
        &self,
        raw: &str,
        imports: &HashMap<String, String>,
        fold_case: bool,
    ) -> Vec<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Vec::new();
        }
        if let Some(absolute) = raw.strip_prefix('\\') {
            return vec![absolute.to_string()];
        }
        if let Some(relative) = strip_namespace_keyword(raw) {
            return vec![self.qualify(relative)];
        }
        if raw.contains('\\') {
            // Qualified: the first segment goes through class imports
            return self.resolve_class(raw).into_iter().collect();
        }

        let key = if fold_case { raw.to_lowercase() } else { raw.to_string() };
        if let Some(target) = imports.get(&key) {
            return vec![target.clone()];
        }

        let namespaced = self.qualify(raw);
        if self.namespace.is_empty() {
            vec![namespaced]
        } else {
            vec![namespaced, raw.to_string()]
        }
    }
}

/// Kind and FQN a single use clause imports
pub fn import_of_clause(
    tree: &SyntaxTree,
    clause: NodeId,
    declared: ImportKind,
    prefix: Option<&str>,
) -> Option<(ImportKind, String)> {
    let own = match tree.kind(clause) {
        NodeKind::UseClause(kind) => kind,
        _ => return None,
    };
    let kind = if own == ImportKind::Class { declared } else { own };

    let name = tree.name_child(clause)?;
    let imported = tree.text(name).trim_start_matches('\\');
    if imported.is_empty() {
        return None;
    }
    let target = match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}\\{}", prefix, imported),
        _ => imported.to_string(),
    };
    Some((kind, target))
}

/// Resolve a use clause found anywhere in the tree to its import target
pub fn use_clause_target(tree: &SyntaxTree, clause: NodeId) -> Option<(ImportKind, String)> {
    let mut declaration = tree.parent(clause)?;
    let mut prefix = None;
    if tree.kind(declaration) == NodeKind::UseGroup {
        declaration = tree.parent(declaration)?;
        prefix = tree
            .name_child(declaration)
            .map(|name| tree.text(name).trim_matches('\\').to_string());
    }
    let declared = match tree.kind(declaration) {
        NodeKind::UseDeclaration(kind) => kind,
        _ => return None,
    };
    import_of_clause(tree, clause, declared, prefix.as_deref())
}

fn clause_alias(tree: &SyntaxTree, clause: NodeId) -> Option<String> {
    let alias = tree.child_by_field(clause, Field::Alias).or_else(|| {
        tree.child_of_kind(clause, NodeKind::UseAlias)
            .and_then(|aliasing| tree.name_child(aliasing))
    })?;
    Some(tree.text(alias).to_string())
}

/// Innermost named class-like declaration around a node. Anonymous classes shadow it.
pub fn enclosing_class(tree: &SyntaxTree, node: NodeId) -> Option<NodeId> {
    for ancestor in std::iter::once(node).chain(tree.ancestors(node)) {
        match tree.kind(ancestor) {
            kind if kind.is_class_like() => return Some(ancestor),
            NodeKind::AnonymousClass => return None,
            NodeKind::ObjectCreation
                if tree.child_of_kind(ancestor, NodeKind::DeclarationList).is_some() =>
            {
                return None
            }
            _ => {}
        }
    }
    None
}

/// FQN of a class-like declaration node
pub fn class_fqn(tree: &SyntaxTree, class: NodeId, context: &NameContext) -> Option<String> {
    let name = tree.child_by_field(class, Field::Name)?;
    Some(context.qualify(tree.text(name)))
}

/// Resolved names in the `extends` and `implements` clauses of a class-like
pub fn class_parents(tree: &SyntaxTree, class: NodeId, context: &NameContext) -> Vec<String> {
    tree.children(class)
        .filter(|child| {
            matches!(tree.kind(*child), NodeKind::BaseClause | NodeKind::InterfaceClause)
        })
        .flat_map(|clause| tree.children(clause))
        .filter(|name| matches!(tree.kind(*name), NodeKind::Name | NodeKind::QualifiedName))
        .filter_map(|name| context.resolve_class(tree.text(name)))
        .collect()
}

/// FQN a `self`, `static` or `parent` scope stands for
pub fn resolve_relative_scope(
    tree: &SyntaxTree,
    node: NodeId,
    keyword: &str,
    context: &NameContext,
) -> Option<String> {
    let class = enclosing_class(tree, node)?;
    match keyword.to_lowercase().as_str() {
        "self" | "static" => class_fqn(tree, class, context),
        "parent" => {
            let base = tree.child_of_kind(class, NodeKind::BaseClause)?;
            let name = tree.name_child(base)?;
            context.resolve_class(tree.text(name))
        }
        _ => None,
    }
}

pub fn is_relative_scope(name: &str) -> bool {
    matches!(name.to_lowercase().as_str(), "self" | "static" | "parent")
}

fn strip_namespace_keyword(raw: &str) -> Option<&str> {
    let head = raw.get(..10)?;
    if head.eq_ignore_ascii_case("namespace\\") {
        Some(&raw[10..])
    } else {
        None
    }
}

fn last_segment(name: &str) -> &str {
    name.rsplit('\\').next().unwrap_or(name)
}
