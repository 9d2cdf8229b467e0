// Definition resolution: syntax node -> FQN -> Definition

pub mod names;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::index::{Definition, IndexStatus, Repository};
use crate::syntax::{Field, ImportKind, NodeId, NodeKind, SyntaxTree};

pub use names::NameContext;
use names::{class_fqn, enclosing_class, resolve_relative_scope, use_clause_target};

/// Widen the node under the cursor to the node that carries a whole name
pub fn target_node(tree: &SyntaxTree, leaf: NodeId) -> NodeId {
    let mut node = leaf;
    // Segments of a qualified name or variable stand for the whole thing
    while matches!(
        tree.kind(node),
        NodeKind::Name | NodeKind::NamespaceName | NodeKind::Other
    ) {
        let Some(parent) = tree.parent(node) else {
            break;
        };
        let climbs = match tree.kind(parent) {
            NodeKind::QualifiedName | NodeKind::NamespaceName | NodeKind::VariableName => true,
            NodeKind::Other => tree
                .parent(parent)
                .is_some_and(|outer| tree.kind(outer) == NodeKind::QualifiedName),
            _ => false,
        };
        if !climbs {
            break;
        }
        node = parent;
    }

    let kind = tree.kind(node);
    if kind.is_declaration() || is_usage(kind) {
        return node;
    }
    if !kind.is_name() {
        return node;
    }
    let Some(parent) = tree.parent(node) else {
        return node;
    };

    let field = tree.field(node);
    match tree.kind(parent) {
        NodeKind::FunctionCall if field == Some(Field::Function) => parent,
        NodeKind::MemberCall
        | NodeKind::MemberAccess
        | NodeKind::ScopedCall
        | NodeKind::ScopedPropertyAccess
            if field == Some(Field::Name) =>
        {
            parent
        }
        NodeKind::ClassConstantAccess if is_member_name_of_constant_access(tree, parent, node) => {
            parent
        }
        NodeKind::UseClause(_) => parent,
        NodeKind::UseAlias => tree.parent(parent).unwrap_or(parent),
        NodeKind::PropertyElement
        | NodeKind::PromotedProperty
        | NodeKind::ConstElement
        | NodeKind::EnumCase => parent,
        parent_kind if parent_kind.is_declaration() && field == Some(Field::Name) => parent,
        _ => node,
    }
}

fn is_usage(kind: NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::FunctionCall
            | NodeKind::ScopedCall
            | NodeKind::ClassConstantAccess
            | NodeKind::ScopedPropertyAccess
            | NodeKind::MemberCall
            | NodeKind::MemberAccess
            | NodeKind::UseClause(_)
    )
}

fn is_member_name_of_constant_access(tree: &SyntaxTree, access: NodeId, node: NodeId) -> bool {
    let children: Vec<NodeId> = tree.children(access).collect();
    children.len() > 1 && children.last() == Some(&node)
}

/// FQN a declaration node defines
pub fn defined_fqn(tree: &SyntaxTree, node: NodeId) -> Option<String> {
    defined_fqn_in(tree, node, &NameContext::for_node(tree, node))
}

pub(crate) fn defined_fqn_in(
    tree: &SyntaxTree,
    node: NodeId,
    context: &NameContext,
) -> Option<String> {
    let kind = tree.kind(node);
    if kind.is_class_like() {
        return class_fqn(tree, node, context);
    }

    match kind {
        NodeKind::FunctionDefinition => {
            let name = tree.child_by_field(node, Field::Name)?;
            Some(format!("{}()", context.qualify(tree.text(name))))
        }
        NodeKind::MethodDeclaration => {
            let class = member_owner(tree, node, context)?;
            let name = tree.child_by_field(node, Field::Name)?;
            Some(format!("{}::{}()", class, tree.text(name)))
        }
        NodeKind::PropertyElement => {
            let class = member_owner(tree, node, context)?;
            let name = property_name(tree, node)?;
            let is_static = tree
                .parent(node)
                .and_then(|declaration| tree.child_of_kind(declaration, NodeKind::StaticModifier))
                .is_some();
            if is_static {
                Some(format!("{}::${}", class, name))
            } else {
                Some(format!("{}->{}", class, name))
            }
        }
        NodeKind::PromotedProperty => {
            let class = member_owner(tree, node, context)?;
            let name = property_name(tree, node)?;
            Some(format!("{}->{}", class, name))
        }
        NodeKind::ConstElement => {
            let name = tree.name_child(node)?;
            let in_class = tree
                .parent(node)
                .and_then(|declaration| tree.parent(declaration))
                .is_some_and(|owner| tree.kind(owner) == NodeKind::DeclarationList);
            if in_class {
                let class = member_owner(tree, node, context)?;
                Some(format!("{}::{}", class, tree.text(name)))
            } else {
                Some(context.qualify(tree.text(name)))
            }
        }
        NodeKind::EnumCase => {
            let class = member_owner(tree, node, context)?;
            let name = tree.child_by_field(node, Field::Name).or_else(|| tree.name_child(node))?;
            Some(format!("{}::{}", class, tree.text(name)))
        }
        _ => None,
    }
}

fn member_owner(tree: &SyntaxTree, node: NodeId, context: &NameContext) -> Option<String> {
    let class = enclosing_class(tree, node)?;
    class_fqn(tree, class, context)
}

/// Property name without its `$`
pub(crate) fn property_name(tree: &SyntaxTree, node: NodeId) -> Option<String> {
    let variable = tree
        .child_by_field(node, Field::Name)
        .filter(|name| tree.kind(*name) == NodeKind::VariableName)
        .or_else(|| tree.child_of_kind(node, NodeKind::VariableName))?;
    Some(tree.text(variable).trim_start_matches('$').to_string())
}

/// Primary FQN a usage node refers to
pub fn referenced_fqn(tree: &SyntaxTree, node: NodeId) -> Option<String> {
    referenced_fqns(tree, node).into_iter().next()
}

/// Every candidate FQN of a usage, primary first
pub fn referenced_fqns(tree: &SyntaxTree, node: NodeId) -> Vec<String> {
    referenced_fqns_in(tree, node, &NameContext::for_node(tree, node))
}

pub(crate) fn referenced_fqns_in(
    tree: &SyntaxTree,
    node: NodeId,
    context: &NameContext,
) -> Vec<String> {
    match tree.kind(node) {
        NodeKind::Name | NodeKind::QualifiedName => name_usage(tree, node, context),
        NodeKind::FunctionCall => tree
            .child_by_field(node, Field::Function)
            .filter(|function| {
                matches!(tree.kind(*function), NodeKind::Name | NodeKind::QualifiedName)
            })
            .map(|function| context.resolve_function(tree.text(function)))
            .unwrap_or_default(),
        NodeKind::ScopedCall => {
            let class = tree
                .child_by_field(node, Field::Scope)
                .and_then(|scope| scope_class(tree, scope, context));
            let name = tree
                .child_by_field(node, Field::Name)
                .filter(|name| tree.kind(*name) == NodeKind::Name);
            match (class, name) {
                (Some(class), Some(name)) => vec![format!("{}::{}()", class, tree.text(name))],
                _ => Vec::new(),
            }
        }
        NodeKind::ClassConstantAccess => {
            let children: Vec<NodeId> = tree.children(node).collect();
            let (Some(scope), Some(name)) = (children.first(), children.last()) else {
                return Vec::new();
            };
            if children.len() < 2
                || tree.kind(*name) != NodeKind::Name
                || tree.text(*name).eq_ignore_ascii_case("class")
            {
                return Vec::new();
            }
            scope_class(tree, *scope, context)
                .map(|class| vec![format!("{}::{}", class, tree.text(*name))])
                .unwrap_or_default()
        }
        NodeKind::ScopedPropertyAccess => {
            let class = tree
                .child_by_field(node, Field::Scope)
                .and_then(|scope| scope_class(tree, scope, context));
            let name = tree
                .child_by_field(node, Field::Name)
                .filter(|name| tree.kind(*name) == NodeKind::VariableName);
            match (class, name) {
                (Some(class), Some(name)) => vec![format!(
                    "{}::${}",
                    class,
                    tree.text(name).trim_start_matches('$')
                )],
                _ => Vec::new(),
            }
        }
        NodeKind::MemberCall | NodeKind::MemberAccess => {
            let on_this = tree
                .child_by_field(node, Field::Object)
                .is_some_and(|object| {
                    tree.kind(object) == NodeKind::VariableName && tree.text(object) == "$this"
                });
            let name = tree
                .child_by_field(node, Field::Name)
                .filter(|name| tree.kind(*name) == NodeKind::Name);
            let class = on_this
                .then(|| member_owner(tree, node, context))
                .flatten();
            match (class, name) {
                (Some(class), Some(name)) if tree.kind(node) == NodeKind::MemberCall => {
                    vec![format!("{}::{}()", class, tree.text(name))]
                }
                (Some(class), Some(name)) => vec![format!("{}->{}", class, tree.text(name))],
                _ => Vec::new(),
            }
        }
        NodeKind::UseClause(_) => match use_clause_target(tree, node) {
            Some((ImportKind::Function, target)) => vec![format!("{}()", target)],
            Some((_, target)) => vec![target],
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// A bare or qualified name in class or constant position
fn name_usage(tree: &SyntaxTree, node: NodeId, context: &NameContext) -> Vec<String> {
    let Some(parent) = tree.parent(node) else {
        return Vec::new();
    };
    let field = tree.field(node);
    if matches!(field, Some(Field::Name) | Some(Field::Alias)) {
        return Vec::new();
    }

    let as_class = || context.resolve_class(tree.text(node)).into_iter().collect();
    match tree.kind(parent) {
        NodeKind::ObjectCreation
        | NodeKind::BaseClause
        | NodeKind::InterfaceClause
        | NodeKind::NamedType
        | NodeKind::Attribute
        | NodeKind::TraitUse => as_class(),
        NodeKind::ScopedCall | NodeKind::ScopedPropertyAccess if field == Some(Field::Scope) => {
            as_class()
        }
        NodeKind::ClassConstantAccess if tree.children(parent).next() == Some(node) => as_class(),
        NodeKind::Instanceof if field == Some(Field::Right) => as_class(),
        NodeKind::Instanceof | NodeKind::Expression => context.resolve_constant(tree.text(node)),
        NodeKind::ConstElement if tree.children(parent).next() != Some(node) => {
            context.resolve_constant(tree.text(node))
        }
        _ if matches!(field, Some(Field::Value) | Some(Field::DefaultValue)) => {
            context.resolve_constant(tree.text(node))
        }
        _ => Vec::new(),
    }
}

/// Class FQN named by the scope of a `::` access
fn scope_class(tree: &SyntaxTree, scope: NodeId, context: &NameContext) -> Option<String> {
    match tree.kind(scope) {
        NodeKind::RelativeScope => resolve_relative_scope(tree, scope, tree.text(scope), context),
        NodeKind::Name | NodeKind::QualifiedName => {
            let text = tree.text(scope);
            if names::is_relative_scope(text) {
                resolve_relative_scope(tree, scope, text, context)
            } else {
                context.resolve_class(text)
            }
        }
        _ => None,
    }
}

/// Sub-node whose range is reported for a declaration or usage
pub fn name_range_node(tree: &SyntaxTree, node: NodeId) -> NodeId {
    let named = match tree.kind(node) {
        NodeKind::FunctionCall => tree.child_by_field(node, Field::Function),
        NodeKind::ScopedCall
        | NodeKind::ScopedPropertyAccess
        | NodeKind::MemberCall
        | NodeKind::MemberAccess => tree.child_by_field(node, Field::Name),
        NodeKind::ClassConstantAccess => tree.children(node).last(),
        NodeKind::UseClause(_) => tree.name_child(node),
        NodeKind::PropertyElement | NodeKind::PromotedProperty => tree
            .child_by_field(node, Field::Name)
            .or_else(|| tree.child_of_kind(node, NodeKind::VariableName)),
        kind if kind.is_declaration() => tree
            .child_by_field(node, Field::Name)
            .or_else(|| tree.name_child(node)),
        _ => None,
    };
    named.unwrap_or(node)
}

/// Candidate FQNs at a node: the declared FQN, or the referenced ones
pub fn candidate_fqns(tree: &SyntaxTree, node: NodeId) -> Vec<String> {
    let context = NameContext::for_node(tree, node);
    match defined_fqn_in(tree, node, &context) {
        Some(fqn) => vec![fqn],
        None => referenced_fqns_in(tree, node, &context),
    }
}

/// Looks definitions up, waiting on the index while the initial sweep runs
#[derive(Clone)]
pub struct DefinitionResolver {
    repo: Arc<Repository>,
}

impl DefinitionResolver {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// First candidate with a definition, directly or through inheritance
    pub fn lookup(&self, candidates: &[String]) -> Option<Definition> {
        candidates
            .iter()
            .find_map(|fqn| self.repo.get_definition(fqn))
            .or_else(|| {
                candidates
                    .iter()
                    .find_map(|fqn| self.repo.get_inherited_definition(fqn))
            })
    }

    pub async fn resolve_to_definition(&self, tree: &SyntaxTree, node: NodeId) -> Option<Definition> {
        let candidates = candidate_fqns(tree, node);
        if candidates.is_empty() {
            return None;
        }
        self.wait_for_definition(&candidates).await
    }

    /// Retry the lookup on every index event until found or the index is complete
    pub async fn wait_for_definition(&self, candidates: &[String]) -> Option<Definition> {
        // Subscribe before the first lookup so no insertion slips between them
        let mut events = self.repo.subscribe();
        loop {
            if let Some(definition) = self.lookup(candidates) {
                return Some(definition);
            }
            if self.repo.status() == IndexStatus::Complete {
                // One last look: an insertion may land just before completion
                return self.lookup(candidates);
            }
            match events.recv().await {
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Resolver lagged {} index events, retrying", skipped);
                }
                Err(RecvError::Closed) => return self.lookup(candidates),
            }
        }
    }

    /// Park until the initial sweep has finished
    pub async fn wait_for_complete(&self) {
        let mut events = self.repo.subscribe();
        while self.repo.status() != IndexStatus::Complete {
            if let Err(RecvError::Closed) = events.recv().await {
                return;
            }
        }
    }
}
