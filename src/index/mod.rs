// Index data model, repository and snapshot persistence

pub mod query;
pub mod repository;
pub mod schema;
pub mod snapshot;

use serde::{Deserialize, Serialize};

pub use repository::{Repository, RepositoryStats};

/// Zero-based line and UTF-16 column, as used by the editor protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Source range, end exclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, position: Position) -> bool {
        self.start <= position && position <= self.end
    }
}

impl From<Position> for lsp_types::Position {
    fn from(position: Position) -> Self {
        lsp_types::Position::new(position.line, position.character)
    }
}

impl From<lsp_types::Position> for Position {
    fn from(position: lsp_types::Position) -> Self {
        Position::new(position.line, position.character)
    }
}

impl From<Range> for lsp_types::Range {
    fn from(range: Range) -> Self {
        lsp_types::Range::new(range.start.into(), range.end.into())
    }
}

/// Symbol kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Interface,
    Trait,
    Enum,
    EnumCase,
    Function,
    Method,
    Property,
    ClassConstant,
    Constant,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Class => "class",
            SymbolKind::Interface => "interface",
            SymbolKind::Trait => "trait",
            SymbolKind::Enum => "enum",
            SymbolKind::EnumCase => "enum_case",
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Property => "property",
            SymbolKind::ClassConstant => "class_constant",
            SymbolKind::Constant => "constant",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "class" => Ok(SymbolKind::Class),
            "interface" => Ok(SymbolKind::Interface),
            "trait" => Ok(SymbolKind::Trait),
            "enum" => Ok(SymbolKind::Enum),
            "enum_case" => Ok(SymbolKind::EnumCase),
            "function" => Ok(SymbolKind::Function),
            "method" => Ok(SymbolKind::Method),
            "property" => Ok(SymbolKind::Property),
            "class_constant" => Ok(SymbolKind::ClassConstant),
            "constant" => Ok(SymbolKind::Constant),
            _ => anyhow::bail!("Unknown symbol kind: {}", s),
        }
    }

    /// Types that can own members
    pub fn is_class_like(&self) -> bool {
        matches!(
            self,
            SymbolKind::Class | SymbolKind::Interface | SymbolKind::Trait | SymbolKind::Enum
        )
    }

    pub fn is_member(&self) -> bool {
        matches!(
            self,
            SymbolKind::Method | SymbolKind::Property | SymbolKind::ClassConstant | SymbolKind::EnumCase
        )
    }

    pub fn to_lsp(&self) -> lsp_types::SymbolKind {
        match self {
            SymbolKind::Class | SymbolKind::Trait => lsp_types::SymbolKind::CLASS,
            SymbolKind::Interface => lsp_types::SymbolKind::INTERFACE,
            SymbolKind::Enum => lsp_types::SymbolKind::ENUM,
            SymbolKind::EnumCase => lsp_types::SymbolKind::ENUM_MEMBER,
            SymbolKind::Function => lsp_types::SymbolKind::FUNCTION,
            SymbolKind::Method => lsp_types::SymbolKind::METHOD,
            SymbolKind::Property => lsp_types::SymbolKind::PROPERTY,
            SymbolKind::ClassConstant | SymbolKind::Constant => lsp_types::SymbolKind::CONSTANT,
        }
    }
}

/// A declared symbol, owned by exactly one namespace of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub fqn: String,
    pub range: Range,
    /// Name of the owning namespace within the same file
    pub namespace: String,
    /// FQN of the enclosing type, for members
    pub container: Option<String>,
}

/// Namespace block(s) of one file, merged by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub symbols: Vec<Symbol>,
}

/// The declaring occurrence of an FQN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub fqn: String,
    pub name: String,
    pub kind: SymbolKind,
    pub uri: String,
    pub range: Range,
    pub container: Option<String>,
    pub signature: Option<String>,
    pub documentation: Option<String>,
    /// Resolved `extends` / `implements` targets of a class-like
    pub parents: Vec<String>,
}

/// A non-declaring use of an FQN
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub fqn: String,
    pub uri: String,
    pub range: Range,
    /// Global name an unqualified function or constant falls back to when
    /// `fqn` has no definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl Reference {
    /// Every FQN this reference may bind to
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.fqn.as_str()).chain(self.fallback.as_deref())
    }
}

/// Everything the index knows about one URI. Replaced wholesale on reparse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub uri: String,
    pub content_hash: String,
    pub parse_duration_ms: u64,
    pub has_errors: bool,
    pub namespaces: Vec<Namespace>,
    pub definitions: Vec<Definition>,
    pub references: Vec<Reference>,
}

impl File {
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.namespaces.iter().flat_map(|ns| ns.symbols.iter())
    }
}

/// Progress of the initial indexing sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexStatus {
    NotStarted,
    Indexing,
    Complete,
}

/// Broadcast to every subscriber of the repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    DefinitionAdded(String),
    Complete,
}

/// Split a member FQN into its type and member suffix (`A\B::m()` -> `A\B`, `::m()`)
pub fn split_member_fqn(fqn: &str) -> Option<(&str, &str)> {
    let at = match (fqn.find("::"), fqn.find("->")) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&fqn[..at], &fqn[at..]))
}
