// PHP syntax provider backed by tree-sitter-php

use anyhow::{anyhow, Result};
use tree_sitter::{Node, Parser};

use super::{Field, ImportKind, NodeKind, SyntaxProvider, SyntaxTree, SyntaxTreeBuilder};

const PHP_EXTENSIONS: &[&str] = &[".php", ".phtml", ".inc"];

/// Non-`*_expression` nodes that hold expressions directly
const EXPRESSION_HOLDERS: &[&str] = &[
    "argument",
    "array_element_initializer",
    "arrow_function",
    "case_statement",
    "echo_statement",
    "exit_statement",
    "expression_statement",
    "for_statement",
    "match_condition_list",
    "print_intrinsic",
    "return_statement",
    "static_variable_declaration",
];

/// Parses PHP sources and lowers the tree-sitter CST into the owned arena
#[derive(Debug, Default, Clone, Copy)]
pub struct PhpSyntaxProvider;

impl PhpSyntaxProvider {
    pub fn new() -> Self {
        Self
    }
}

impl SyntaxProvider for PhpSyntaxProvider {
    fn can_parse(&self, uri: &str) -> bool {
        let lower = uri.to_lowercase();
        PHP_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
    }

    fn parse(&self, uri: &str, text: &str) -> Result<SyntaxTree> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_php::LANGUAGE_PHP.into())
            .map_err(|e| anyhow!("Failed to load PHP grammar: {}", e))?;

        let tree = parser
            .parse(text, None)
            .ok_or_else(|| anyhow!("Failed to parse {}", uri))?;

        Ok(lower(uri, text, tree.root_node()))
    }
}

/// Copy named nodes into the arena with an explicit cursor walk
fn lower(uri: &str, text: &str, root: Node) -> SyntaxTree {
    let mut builder = SyntaxTreeBuilder::new(uri, text);
    let root_id = builder.push(NodeKind::Program, None, root.byte_range(), None);
    if root.has_error() {
        builder.mark_errors();
    }

    let mut cursor = root.walk();
    let mut parents = vec![root_id];
    if !cursor.goto_first_child() {
        return builder.finish();
    }

    loop {
        let node = cursor.node();
        let parent = parents.last().copied().unwrap_or(root_id);

        let mut id = None;
        if node.is_missing() {
            builder.mark_errors();
        } else if node.is_named() {
            id = Some(builder.push(
                classify(node),
                field_role(cursor.field_name()),
                node.byte_range(),
                Some(parent),
            ));
        }

        // Anonymous nodes are transparent: their named children attach to our parent
        if node.child_count() > 0 && cursor.goto_first_child() {
            parents.push(id.unwrap_or(parent));
            continue;
        }

        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return builder.finish();
            }
            parents.pop();
        }
    }
}

fn classify(node: Node) -> NodeKind {
    match node.kind() {
        "program" => NodeKind::Program,
        "namespace_definition" => NodeKind::NamespaceDefinition,
        "namespace_name" => NodeKind::NamespaceName,
        "namespace_use_declaration" => NodeKind::UseDeclaration(use_declaration_kind(node)),
        "namespace_use_clause" | "namespace_use_group_clause" => {
            NodeKind::UseClause(import_kind(node))
        }
        "namespace_use_group" => NodeKind::UseGroup,
        "namespace_aliasing_clause" => NodeKind::UseAlias,
        "class_declaration" => NodeKind::ClassDeclaration,
        "interface_declaration" => NodeKind::InterfaceDeclaration,
        "trait_declaration" => NodeKind::TraitDeclaration,
        "enum_declaration" => NodeKind::EnumDeclaration,
        "anonymous_class" => NodeKind::AnonymousClass,
        "enum_case" => NodeKind::EnumCase,
        "function_definition" => NodeKind::FunctionDefinition,
        "method_declaration" => NodeKind::MethodDeclaration,
        "property_declaration" => NodeKind::PropertyDeclaration,
        "property_element" => NodeKind::PropertyElement,
        "property_promotion_parameter" => NodeKind::PromotedProperty,
        "const_declaration" => NodeKind::ConstDeclaration,
        "const_element" => NodeKind::ConstElement,
        "declaration_list" | "enum_declaration_list" => NodeKind::DeclarationList,
        "compound_statement" => NodeKind::CompoundStatement,
        "base_clause" => NodeKind::BaseClause,
        "class_interface_clause" => NodeKind::InterfaceClause,
        "static_modifier" => NodeKind::StaticModifier,
        "use_declaration" => NodeKind::TraitUse,
        "attribute" => NodeKind::Attribute,
        "name" => NodeKind::Name,
        "qualified_name" | "relative_name" => NodeKind::QualifiedName,
        "relative_scope" => NodeKind::RelativeScope,
        "variable_name" => NodeKind::VariableName,
        "named_type" => NodeKind::NamedType,
        "function_call_expression" => NodeKind::FunctionCall,
        "object_creation_expression" => NodeKind::ObjectCreation,
        "scoped_call_expression" => NodeKind::ScopedCall,
        "class_constant_access_expression" => NodeKind::ClassConstantAccess,
        "scoped_property_access_expression" => NodeKind::ScopedPropertyAccess,
        "member_call_expression" | "nullsafe_member_call_expression" => NodeKind::MemberCall,
        "member_access_expression" | "nullsafe_member_access_expression" => {
            NodeKind::MemberAccess
        }
        "binary_expression" if has_token(node, "instanceof") => NodeKind::Instanceof,
        "comment" => NodeKind::Comment,
        "ERROR" => NodeKind::Error,
        kind if kind.ends_with("_expression") || EXPRESSION_HOLDERS.contains(&kind) => {
            NodeKind::Expression
        }
        _ => NodeKind::Other,
    }
}

/// `use function a, b;` carries its keyword on the first clause, a group use on the declaration
fn use_declaration_kind(node: Node) -> ImportKind {
    match import_kind(node) {
        ImportKind::Class => {
            let mut cursor = node.walk();
            let first = node.named_children(&mut cursor).next();
            first
                .filter(|child| child.kind() == "namespace_use_clause")
                .map(import_kind)
                .unwrap_or(ImportKind::Class)
        }
        kind => kind,
    }
}

/// Reads the `function` / `const` keyword of a use declaration or clause
fn import_kind(node: Node) -> ImportKind {
    if has_token(node, "function") {
        ImportKind::Function
    } else if has_token(node, "const") {
        ImportKind::Constant
    } else {
        ImportKind::Class
    }
}

fn has_token(node: Node, token: &str) -> bool {
    let mut cursor = node.walk();
    let found = node
        .children(&mut cursor)
        .any(|child| !child.is_named() && child.kind().eq_ignore_ascii_case(token));
    found
}

fn field_role(name: Option<&str>) -> Option<Field> {
    let field = match name? {
        "name" => Field::Name,
        "body" => Field::Body,
        "alias" => Field::Alias,
        "scope" => Field::Scope,
        "object" => Field::Object,
        "function" => Field::Function,
        "type" => Field::Type,
        "parameters" => Field::Parameters,
        "arguments" => Field::Arguments,
        "value" => Field::Value,
        "default_value" => Field::DefaultValue,
        "left" => Field::Left,
        "right" => Field::Right,
        _ => Field::Other,
    };
    Some(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> SyntaxTree {
        PhpSyntaxProvider::new().parse("file:///test.php", text).unwrap()
    }

    fn kinds(tree: &SyntaxTree) -> Vec<NodeKind> {
        tree.node_ids().map(|id| tree.kind(id)).collect()
    }

    #[test]
    fn test_can_parse() {
        let provider = PhpSyntaxProvider::new();
        assert!(provider.can_parse("file:///src/User.php"));
        assert!(provider.can_parse("file:///views/page.PHTML"));
        assert!(!provider.can_parse("file:///README.md"));
    }

    #[test]
    fn test_parse_class_in_namespace() {
        let tree = parse("<?php\nnamespace App;\n\nclass User {\n    public function save() {}\n}\n");
        let kinds = kinds(&tree);

        assert_eq!(tree.kind(tree.root()), NodeKind::Program);
        assert!(kinds.contains(&NodeKind::NamespaceDefinition));
        assert!(kinds.contains(&NodeKind::ClassDeclaration));
        assert!(kinds.contains(&NodeKind::MethodDeclaration));
        assert!(!tree.has_errors());

        let class = tree
            .children(tree.root())
            .find(|id| tree.kind(*id) == NodeKind::ClassDeclaration)
            .unwrap();
        let name = tree.child_by_field(class, Field::Name).unwrap();
        assert_eq!(tree.text(name), "User");
        assert_eq!(tree.range(class).start.line, 3);
    }

    #[test]
    fn test_use_declaration_kinds() {
        let tree = parse(concat!(
            "<?php\n",
            "use Foo\\Bar;\n",
            "use function Foo\\helper, Foo\\other;\n",
            "use const Foo\\LIMIT;\n",
            "use function Foo\\{alpha, beta};\n",
        ));
        let imports: Vec<NodeKind> = kinds(&tree)
            .into_iter()
            .filter(|kind| matches!(kind, NodeKind::UseDeclaration(_)))
            .collect();

        assert_eq!(
            imports,
            vec![
                NodeKind::UseDeclaration(ImportKind::Class),
                NodeKind::UseDeclaration(ImportKind::Function),
                NodeKind::UseDeclaration(ImportKind::Constant),
                NodeKind::UseDeclaration(ImportKind::Function),
            ]
        );
    }

    #[test]
    fn test_labels_are_not_expressions() {
        let tree = parse("<?php\nstart:\necho LIMIT;\ngoto start;\n");
        let parents: Vec<NodeKind> = tree
            .node_ids()
            .filter(|id| tree.kind(*id) == NodeKind::Name)
            .filter_map(|id| tree.parent(id))
            .map(|parent| tree.kind(parent))
            .collect();

        assert_eq!(
            parents,
            vec![NodeKind::Other, NodeKind::Expression, NodeKind::Other]
        );
    }

    #[test]
    fn test_malformed_source_still_parses() {
        let tree = parse("<?php\nfunction ok() {}\n$x = ;\n");

        assert!(tree.has_errors());
        assert!(kinds(&tree).contains(&NodeKind::FunctionDefinition));
    }

    #[test]
    fn test_every_child_points_back_to_its_parent() {
        let tree = parse("<?php\n$a = new \\Foo\\Bar(1, strlen('x'));\n");
        let root = tree.root();
        assert_eq!(tree.parent(root), None);

        for id in tree.node_ids().skip(1) {
            let parent = tree.parent(id).unwrap();
            assert!(tree.children(parent).any(|child| child == id));
        }
    }
}
