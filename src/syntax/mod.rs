// Owned syntax tree shared by the collector, resolver and query handlers

pub mod php;

use std::ops::Range as ByteRange;
use std::sync::Arc;

use anyhow::Result;

use crate::index::{Position, Range};

pub use php::PhpSyntaxProvider;

/// Parses source text into a [`SyntaxTree`]
pub trait SyntaxProvider: Send + Sync {
    /// Check if this provider handles the given URI
    fn can_parse(&self, uri: &str) -> bool;

    /// Parse text. Syntax errors never fail the parse; they become `Error` nodes.
    fn parse(&self, uri: &str, text: &str) -> Result<SyntaxTree>;
}

/// Index of a node inside its tree's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a `use` declaration imports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportKind {
    Class,
    Function,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Program,
    NamespaceDefinition,
    NamespaceName,
    UseDeclaration(ImportKind),
    UseClause(ImportKind),
    UseGroup,
    UseAlias,
    ClassDeclaration,
    InterfaceDeclaration,
    TraitDeclaration,
    EnumDeclaration,
    AnonymousClass,
    EnumCase,
    FunctionDefinition,
    MethodDeclaration,
    PropertyDeclaration,
    PropertyElement,
    PromotedProperty,
    ConstDeclaration,
    ConstElement,
    DeclarationList,
    CompoundStatement,
    BaseClause,
    InterfaceClause,
    StaticModifier,
    TraitUse,
    Attribute,
    Name,
    QualifiedName,
    RelativeScope,
    VariableName,
    NamedType,
    FunctionCall,
    ObjectCreation,
    ScopedCall,
    ClassConstantAccess,
    ScopedPropertyAccess,
    MemberCall,
    MemberAccess,
    Instanceof,
    /// Any other node whose bare name children are constant reads
    Expression,
    Comment,
    Error,
    Other,
}

impl NodeKind {
    pub fn is_class_like(self) -> bool {
        matches!(
            self,
            NodeKind::ClassDeclaration
                | NodeKind::InterfaceDeclaration
                | NodeKind::TraitDeclaration
                | NodeKind::EnumDeclaration
        )
    }

    /// Nodes whose name is a definition
    pub fn is_declaration(self) -> bool {
        self.is_class_like()
            || matches!(
                self,
                NodeKind::FunctionDefinition
                    | NodeKind::MethodDeclaration
                    | NodeKind::PropertyElement
                    | NodeKind::PromotedProperty
                    | NodeKind::ConstElement
                    | NodeKind::EnumCase
            )
    }

    /// Name-shaped leaves a cursor usually lands on
    pub fn is_name(self) -> bool {
        matches!(
            self,
            NodeKind::Name
                | NodeKind::QualifiedName
                | NodeKind::NamespaceName
                | NodeKind::VariableName
                | NodeKind::RelativeScope
        )
    }
}

/// Field role of a node within its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Body,
    Alias,
    Scope,
    Object,
    Function,
    Type,
    Parameters,
    Arguments,
    Value,
    DefaultValue,
    Left,
    Right,
    Other,
}

#[derive(Debug, Clone)]
pub struct SyntaxNode {
    pub kind: NodeKind,
    pub field: Option<Field>,
    pub bytes: ByteRange<usize>,
    pub range: Range,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Arena tree with parent links. The root is always node 0.
#[derive(Debug, Clone)]
pub struct SyntaxTree {
    uri: String,
    text: Arc<str>,
    nodes: Vec<SyntaxNode>,
    has_errors: bool,
    lines: LineIndex,
}

impl SyntaxTree {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn source(&self) -> &str {
        &self.text
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Every node id in pre-order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn node(&self, id: NodeId) -> &SyntaxNode {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.node(id).kind
    }

    pub fn field(&self, id: NodeId) -> Option<Field> {
        self.node(id).field
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn range(&self, id: NodeId) -> Range {
        self.node(id).range
    }

    pub fn text(&self, id: NodeId) -> &str {
        let bytes = self.node(id).bytes.clone();
        self.text.get(bytes).unwrap_or("")
    }

    pub fn children(&self, id: NodeId) -> impl DoubleEndedIterator<Item = NodeId> + '_ {
        self.node(id).children.iter().copied()
    }

    pub fn child_by_field(&self, id: NodeId, field: Field) -> Option<NodeId> {
        self.children(id).find(|child| self.field(*child) == Some(field))
    }

    pub fn child_of_kind(&self, id: NodeId, kind: NodeKind) -> Option<NodeId> {
        self.children(id).find(|child| self.kind(*child) == kind)
    }

    /// First child holding a (possibly qualified) name
    pub fn name_child(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).find(|child| {
            matches!(
                self.kind(*child),
                NodeKind::Name | NodeKind::QualifiedName | NodeKind::NamespaceName
            )
        })
    }

    /// Strict ancestors, nearest first
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), move |current| self.parent(*current))
    }

    pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let siblings = &self.node(parent).children;
        let at = siblings.iter().position(|sibling| *sibling == id)?;
        at.checked_sub(1).map(|prev| siblings[prev])
    }

    /// Deepest node covering `position`. A cursor just past a name still hits it.
    pub fn node_at(&self, position: Position) -> Option<NodeId> {
        let offset = self.lines.offset(&self.text, position)?;
        let mut current = self.root();
        loop {
            let children = &self.node(current).children;
            let inside = children.iter().copied().find(|child| {
                let bytes = &self.node(*child).bytes;
                bytes.start <= offset && offset < bytes.end
            });
            let touching = || {
                children.iter().copied().find(|child| {
                    let node = self.node(*child);
                    node.bytes.end == offset && (node.kind.is_name() || !node.children.is_empty())
                })
            };
            match inside.or_else(touching) {
                Some(child) => current = child,
                None => return Some(current),
            }
        }
    }

    pub fn offset_at(&self, position: Position) -> Option<usize> {
        self.lines.offset(&self.text, position)
    }
}

/// Incremental arena construction used by the parser adapters
pub struct SyntaxTreeBuilder {
    uri: String,
    text: Arc<str>,
    nodes: Vec<SyntaxNode>,
    has_errors: bool,
    lines: LineIndex,
}

impl SyntaxTreeBuilder {
    pub fn new(uri: &str, text: &str) -> Self {
        Self {
            uri: uri.to_string(),
            lines: LineIndex::new(text),
            text: Arc::from(text),
            nodes: Vec::new(),
            has_errors: false,
        }
    }

    pub fn push(
        &mut self,
        kind: NodeKind,
        field: Option<Field>,
        bytes: ByteRange<usize>,
        parent: Option<NodeId>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let range = Range::new(
            self.lines.position(&self.text, bytes.start),
            self.lines.position(&self.text, bytes.end),
        );
        if kind == NodeKind::Error {
            self.has_errors = true;
        }
        self.nodes.push(SyntaxNode {
            kind,
            field,
            bytes,
            range,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent.index()].children.push(id);
        }
        id
    }

    pub fn mark_errors(&mut self) {
        self.has_errors = true;
    }

    pub fn finish(self) -> SyntaxTree {
        SyntaxTree {
            uri: self.uri,
            text: self.text,
            nodes: self.nodes,
            has_errors: self.has_errors,
            lines: self.lines,
        }
    }
}

/// Line start offsets for byte <-> UTF-16 position conversion
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            text.bytes()
                .enumerate()
                .filter(|(_, byte)| *byte == b'\n')
                .map(|(at, _)| at + 1),
        );
        Self { line_starts }
    }

    pub fn position(&self, text: &str, offset: usize) -> Position {
        let offset = offset.min(text.len());
        let line = self.line_starts.partition_point(|start| *start <= offset) - 1;
        let start = self.line_starts[line];
        let character = match text.get(start..offset) {
            Some(prefix) => prefix.encode_utf16().count(),
            None => offset - start,
        };
        Position::new(line as u32, character as u32)
    }

    /// Byte offset of a position, clamped to the end of its line
    pub fn offset(&self, text: &str, position: Position) -> Option<usize> {
        let start = *self.line_starts.get(position.line as usize)?;
        let mut units = 0u32;
        for (at, ch) in text[start..].char_indices() {
            if units >= position.character || ch == '\n' {
                return Some(start + at);
            }
            units += ch.len_utf16() as u32;
        }
        Some(text.len())
    }
}
