// Definition and reference collection over one parsed file

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::index::{split_member_fqn, Definition, File, Namespace, Reference, Symbol, SymbolKind};
use crate::resolver::names::{class_parents, NameContext, Region};
use crate::resolver::{defined_fqn_in, name_range_node, property_name, referenced_fqns_in};
use crate::syntax::{Field, NodeId, NodeKind, SyntaxTree};

/// Build the `File` record for a tree in a single pre-order pass
pub fn collect(tree: &SyntaxTree, content_hash: String, parse_duration: Duration) -> File {
    let mut collector = Collector::new(tree);
    collector.walk();
    collector.finish(content_hash, parse_duration)
}

struct Collector<'t> {
    tree: &'t SyntaxTree,
    contexts: HashMap<Region, NameContext>,
    namespaces: Vec<Namespace>,
    definitions: Vec<Definition>,
    defined: HashSet<String>,
    references: Vec<Reference>,
}

impl<'t> Collector<'t> {
    fn new(tree: &'t SyntaxTree) -> Self {
        Self {
            tree,
            contexts: HashMap::new(),
            namespaces: Vec::new(),
            definitions: Vec::new(),
            defined: HashSet::new(),
            references: Vec::new(),
        }
    }

    fn walk(&mut self) {
        let tree = self.tree;
        let root = tree.root();

        // Top-level statements inherit the last unbraced namespace before them
        let mut stack = Vec::new();
        let mut current = Region(None);
        for child in tree.children(root) {
            if tree.kind(child) == NodeKind::NamespaceDefinition {
                current = Region(Some(child));
            }
            stack.push((child, current));
        }
        stack.reverse();

        while let Some((node, region)) = stack.pop() {
            self.visit(node, region);
            let inner = if tree.kind(node) == NodeKind::NamespaceDefinition {
                Region(Some(node))
            } else {
                region
            };
            stack.extend(tree.children(node).rev().map(|child| (child, inner)));
        }
    }

    fn context(&mut self, region: Region) -> NameContext {
        let tree = self.tree;
        self.contexts
            .entry(region)
            .or_insert_with(|| NameContext::for_region(tree, region))
            .clone()
    }

    fn visit(&mut self, node: NodeId, region: Region) {
        let kind = self.tree.kind(node);
        if kind == NodeKind::NamespaceDefinition {
            let context = self.context(region);
            self.namespace_entry(&context.namespace);
        } else if kind.is_declaration() {
            let context = self.context(region);
            self.declare(node, &context);
        } else if is_usage(kind) {
            let context = self.context(region);
            self.reference(node, &context);
        }
    }

    fn namespace_entry(&mut self, name: &str) -> &mut Namespace {
        let at = match self.namespaces.iter().position(|ns| ns.name == name) {
            Some(at) => at,
            None => {
                self.namespaces.push(Namespace {
                    name: name.to_string(),
                    symbols: Vec::new(),
                });
                self.namespaces.len() - 1
            }
        };
        &mut self.namespaces[at]
    }

    fn declare(&mut self, node: NodeId, context: &NameContext) {
        let tree = self.tree;
        let Some(fqn) = defined_fqn_in(tree, node, context) else {
            return;
        };
        let Some(name) = declared_name(tree, node) else {
            return;
        };
        let kind = symbol_kind(tree.kind(node), &fqn);
        let container = split_member_fqn(&fqn).map(|(class, _)| class.to_string());
        let range = tree.range(node);

        self.namespace_entry(&context.namespace).symbols.push(Symbol {
            name: name.clone(),
            kind,
            fqn: fqn.clone(),
            range,
            namespace: context.namespace.clone(),
            container: container.clone(),
        });

        // First declaration in the file wins
        if !self.defined.insert(fqn.clone()) {
            return;
        }
        let parents = if kind.is_class_like() {
            let mut parents = class_parents(tree, node, context);
            parents.extend(trait_uses(tree, node, context));
            parents
        } else {
            Vec::new()
        };
        self.definitions.push(Definition {
            fqn,
            name,
            kind,
            uri: tree.uri().to_string(),
            range,
            container,
            signature: signature(tree, node),
            documentation: doc_comment(tree, node),
            parents,
        });
    }

    fn reference(&mut self, node: NodeId, context: &NameContext) {
        let tree = self.tree;
        let mut fqns = referenced_fqns_in(tree, node, context).into_iter();
        let Some(fqn) = fqns.next() else {
            return;
        };
        self.references.push(Reference {
            fqn,
            uri: tree.uri().to_string(),
            range: tree.range(name_range_node(tree, node)),
            fallback: fqns.next(),
        });
    }

    fn finish(self, content_hash: String, parse_duration: Duration) -> File {
        File {
            uri: self.tree.uri().to_string(),
            content_hash,
            parse_duration_ms: parse_duration.as_millis() as u64,
            has_errors: self.tree.has_errors(),
            namespaces: self.namespaces,
            definitions: self.definitions,
            references: self.references,
        }
    }
}

fn is_usage(kind: NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Name
            | NodeKind::QualifiedName
            | NodeKind::FunctionCall
            | NodeKind::ScopedCall
            | NodeKind::ClassConstantAccess
            | NodeKind::ScopedPropertyAccess
            | NodeKind::MemberCall
            | NodeKind::MemberAccess
            | NodeKind::UseClause(_)
    )
}

fn symbol_kind(kind: NodeKind, fqn: &str) -> SymbolKind {
    match kind {
        NodeKind::InterfaceDeclaration => SymbolKind::Interface,
        NodeKind::TraitDeclaration => SymbolKind::Trait,
        NodeKind::EnumDeclaration => SymbolKind::Enum,
        NodeKind::EnumCase => SymbolKind::EnumCase,
        NodeKind::FunctionDefinition => SymbolKind::Function,
        NodeKind::MethodDeclaration => SymbolKind::Method,
        NodeKind::PropertyElement | NodeKind::PromotedProperty => SymbolKind::Property,
        NodeKind::ConstElement if fqn.contains("::") => SymbolKind::ClassConstant,
        NodeKind::ConstElement => SymbolKind::Constant,
        _ => SymbolKind::Class,
    }
}

fn declared_name(tree: &SyntaxTree, node: NodeId) -> Option<String> {
    match tree.kind(node) {
        NodeKind::PropertyElement | NodeKind::PromotedProperty => property_name(tree, node),
        _ => tree
            .child_by_field(node, Field::Name)
            .or_else(|| tree.name_child(node))
            .map(|name| tree.text(name).to_string()),
    }
}

/// `use SomeTrait;` statements in a class body
fn trait_uses(tree: &SyntaxTree, class: NodeId, context: &NameContext) -> Vec<String> {
    let Some(body) = tree.child_by_field(class, Field::Body) else {
        return Vec::new();
    };
    tree.children(body)
        .filter(|statement| tree.kind(*statement) == NodeKind::TraitUse)
        .flat_map(|statement| tree.children(statement))
        .filter(|name| matches!(tree.kind(*name), NodeKind::Name | NodeKind::QualifiedName))
        .filter_map(|name| context.resolve_class(tree.text(name)))
        .collect()
}

/// Declaration header with its body stripped and whitespace collapsed
fn signature(tree: &SyntaxTree, node: NodeId) -> Option<String> {
    let source = tree.source();
    let bytes = tree.node(node).bytes.clone();

    let raw = match tree.kind(node) {
        NodeKind::PropertyElement | NodeKind::ConstElement => {
            let declaration = tree.parent(node)?;
            // Modifiers and type, shared by every element of the declaration
            let first = tree.child_of_kind(declaration, tree.kind(node))?;
            let head = source.get(tree.node(declaration).bytes.start..tree.node(first).bytes.start)?;
            let tail = match tree.kind(node) {
                NodeKind::PropertyElement => {
                    let name = name_range_node(tree, node);
                    source.get(bytes.start..tree.node(name).bytes.end)?
                }
                _ => source.get(bytes.clone())?,
            };
            format!("{}{}", head, tail)
        }
        _ => {
            let end = tree
                .child_by_field(node, Field::Body)
                .map(|body| tree.node(body).bytes.start)
                .unwrap_or(bytes.end);
            source.get(bytes.start..end)?.to_string()
        }
    };

    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches([';', ',']).trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Text of the `/** ... */` block directly above a declaration
fn doc_comment(tree: &SyntaxTree, node: NodeId) -> Option<String> {
    let anchor = match tree.kind(node) {
        NodeKind::PropertyElement | NodeKind::ConstElement => tree.parent(node)?,
        _ => node,
    };
    let previous = tree.prev_sibling(anchor)?;
    if tree.kind(previous) != NodeKind::Comment {
        return None;
    }
    let text = tree.text(previous);
    if !text.starts_with("/**") {
        return None;
    }
    let cleaned = clean_doc_comment(text);
    (!cleaned.is_empty()).then_some(cleaned)
}

fn clean_doc_comment(text: &str) -> String {
    let body = text
        .trim_start_matches("/**")
        .trim_end_matches("*/");
    let lines: Vec<&str> = body
        .lines()
        .map(|line| {
            let line = line.trim();
            let line = line.strip_prefix('*').unwrap_or(line);
            line.strip_prefix(' ').unwrap_or(line).trim_end()
        })
        .collect();

    let start = lines.iter().position(|line| !line.is_empty());
    let end = lines.iter().rposition(|line| !line.is_empty());
    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end].join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Position, Range};
    use crate::syntax::{PhpSyntaxProvider, SyntaxProvider};

    fn collect_text(text: &str) -> File {
        let tree = PhpSyntaxProvider::new().parse("file:///src/test.php", text).unwrap();
        collect(&tree, "hash".to_string(), Duration::from_millis(3))
    }

    fn fqns(file: &File) -> Vec<&str> {
        file.definitions.iter().map(|d| d.fqn.as_str()).collect()
    }

    fn reference_fqns(file: &File) -> Vec<&str> {
        file.references.iter().map(|r| r.fqn.as_str()).collect()
    }

    #[test]
    fn test_single_global_class() {
        let file = collect_text("<?php\nclass Foo {}\n");

        assert_eq!(file.namespaces.len(), 1);
        assert_eq!(file.namespaces[0].name, "");
        let symbols: Vec<&Symbol> = file.symbols().collect();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "Foo");
        assert_eq!(symbols[0].kind, SymbolKind::Class);
        assert_eq!(
            symbols[0].range,
            Range::new(Position::new(1, 0), Position::new(1, 12))
        );
        assert_eq!(fqns(&file), vec!["Foo"]);
        assert_eq!(file.parse_duration_ms, 3);
    }

    #[test]
    fn test_class_members() {
        let file = collect_text(concat!(
            "<?php\n",
            "namespace App\\Models;\n",
            "\n",
            "/**\n",
            " * A registered user.\n",
            " */\n",
            "class User extends Model implements \\JsonSerializable {\n",
            "    use HasEvents;\n",
            "    const TABLE = 'users';\n",
            "    public static $count = 0;\n",
            "    protected ?string $email = null, $phone;\n",
            "    public function __construct(private Clock $clock) {}\n",
            "    /** Persist the user */\n",
            "    public function save(): bool { return true; }\n",
            "}\n",
        ));

        assert_eq!(
            fqns(&file),
            vec![
                "App\\Models\\User",
                "App\\Models\\User::TABLE",
                "App\\Models\\User::$count",
                "App\\Models\\User->email",
                "App\\Models\\User->phone",
                "App\\Models\\User::__construct()",
                "App\\Models\\User->clock",
                "App\\Models\\User::save()",
            ]
        );

        let class = &file.definitions[0];
        assert_eq!(class.kind, SymbolKind::Class);
        assert_eq!(class.documentation.as_deref(), Some("A registered user."));
        assert_eq!(
            class.signature.as_deref(),
            Some("class User extends Model implements \\JsonSerializable")
        );
        assert_eq!(
            class.parents,
            vec!["App\\Models\\Model", "JsonSerializable", "App\\Models\\HasEvents"]
        );

        let save = file.definitions.iter().find(|d| d.name == "save").unwrap();
        assert_eq!(save.kind, SymbolKind::Method);
        assert_eq!(save.container.as_deref(), Some("App\\Models\\User"));
        assert_eq!(save.signature.as_deref(), Some("public function save(): bool"));
        assert_eq!(save.documentation.as_deref(), Some("Persist the user"));

        let phone = file.definitions.iter().find(|d| d.name == "phone").unwrap();
        assert_eq!(phone.kind, SymbolKind::Property);
        assert_eq!(phone.signature.as_deref(), Some("protected ?string $phone"));

        let table = file.definitions.iter().find(|d| d.name == "TABLE").unwrap();
        assert_eq!(table.kind, SymbolKind::ClassConstant);
        assert_eq!(table.signature.as_deref(), Some("const TABLE = 'users'"));
    }

    #[test]
    fn test_functions_constants_and_enums() {
        let file = collect_text(concat!(
            "<?php\n",
            "namespace Lib;\n",
            "const VERSION = '1.0';\n",
            "function boot() {}\n",
            "interface Shape {}\n",
            "trait Greets {}\n",
            "enum Suit: string {\n",
            "    case Hearts = 'H';\n",
            "}\n",
        ));

        assert_eq!(
            fqns(&file),
            vec![
                "Lib\\VERSION",
                "Lib\\boot()",
                "Lib\\Shape",
                "Lib\\Greets",
                "Lib\\Suit",
                "Lib\\Suit::Hearts",
            ]
        );
        let kinds: Vec<SymbolKind> = file.definitions.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SymbolKind::Constant,
                SymbolKind::Function,
                SymbolKind::Interface,
                SymbolKind::Trait,
                SymbolKind::Enum,
                SymbolKind::EnumCase,
            ]
        );
    }

    #[test]
    fn test_references_follow_imports() {
        let file = collect_text(concat!(
            "<?php\n",
            "namespace App;\n",
            "use Vendor\\Mail\\Mailer as Mail;\n",
            "function notify(Mail $mail) {\n",
            "    $mail->send();\n",
            "    return Mail::DEFAULT;\n",
            "}\n",
        ));

        assert_eq!(
            reference_fqns(&file),
            vec![
                "Vendor\\Mail\\Mailer",
                "Vendor\\Mail\\Mailer",
                "Vendor\\Mail\\Mailer::DEFAULT",
                "Vendor\\Mail\\Mailer",
            ]
        );
        // `$mail->send()` has no known receiver type and is dropped
        assert!(file.references.iter().all(|r| !r.fqn.contains("send")));
    }

    #[test]
    fn test_unqualified_call_records_one_reference_with_fallback() {
        let file = collect_text("<?php\nnamespace App;\n\nstrlen('x');\necho PHP_EOL;\n");

        assert_eq!(reference_fqns(&file), vec!["App\\strlen()", "App\\PHP_EOL"]);
        assert_eq!(file.references[0].fallback.as_deref(), Some("strlen()"));
        assert_eq!(file.references[1].fallback.as_deref(), Some("PHP_EOL"));
        assert_eq!(
            file.references[0].range,
            Range::new(Position::new(3, 0), Position::new(3, 6))
        );
    }

    #[test]
    fn test_duplicate_declaration_keeps_first_definition() {
        let file = collect_text(concat!(
            "<?php\n",
            "if (true) { function legacy() { return 1; } }\n",
            "else { function legacy() { return 2; } }\n",
        ));

        assert_eq!(file.symbols().count(), 2);
        assert_eq!(fqns(&file), vec!["legacy()"]);
        assert_eq!(file.definitions[0].range.start.line, 1);
    }

    #[test]
    fn test_anonymous_class_members_are_not_attributed() {
        let file = collect_text(concat!(
            "<?php\n",
            "class Outer {\n",
            "    function make() {\n",
            "        return new class { public function inner() {} };\n",
            "    }\n",
            "}\n",
        ));

        assert_eq!(fqns(&file), vec!["Outer", "Outer::make()"]);
    }

    #[test]
    fn test_malformed_file_is_partially_collected() {
        let file = collect_text("<?php\nfunction ok() {}\n$x = ;\n");

        assert!(file.has_errors);
        assert_eq!(fqns(&file), vec!["ok()"]);
    }

    #[test]
    fn test_clean_doc_comment() {
        assert_eq!(
            clean_doc_comment("/**\n * Line one\n *\n * @return int\n */"),
            "Line one\n\n@return int"
        );
        assert_eq!(clean_doc_comment("/** */"), "");
    }
}
