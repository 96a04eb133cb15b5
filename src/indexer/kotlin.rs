// Kotlin declaration extractor backed by tree-sitter

use std::path::Path;

use tracing::debug;
use tree_sitter::{Node, Parser as TreeParser, Tree, TreeCursor};

use super::extractor::{ExtractError, Extraction, SemanticExtractor, SourceUnit};
use crate::index::{ClassKind, Declaration, DeclarationKind, Parameter, Span};

/// Node kinds that can name a declaration
const NAME_KINDS: &[&str] = &["identifier", "simple_identifier", "type_identifier"];

/// Nodes whose children are walked for declarations; bodies of functions,
/// property initializers and enum entries are never entered
const CONTAINERS: &[&str] = &["source_file", "class_body", "enum_class_body", "ERROR"];

pub struct KotlinExtractor {
    extensions: Vec<String>,
}

impl Default for KotlinExtractor {
    fn default() -> Self {
        Self::new(vec!["kt".to_string(), "kts".to_string()])
    }
}

impl KotlinExtractor {
    pub fn new(extensions: Vec<String>) -> Self {
        Self { extensions }
    }

    fn parse_tree(&self, unit: &SourceUnit) -> Result<Tree, ExtractError> {
        if !self.can_extract(&unit.path) {
            return Err(ExtractError::Unsupported(unit.path.clone()));
        }
        let syntax_error = |message: String| ExtractError::Syntax {
            path: unit.path.clone(),
            message,
        };

        let mut parser = TreeParser::new();
        parser
            .set_language(&tree_sitter_kotlin_ng::LANGUAGE.into())
            .map_err(|e| syntax_error(e.to_string()))?;
        parser
            .parse(unit.text.as_bytes(), None)
            .ok_or_else(|| syntax_error("Failed to parse Kotlin code".to_string()))
    }
}

impl SemanticExtractor for KotlinExtractor {
    fn can_extract(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| self.extensions.iter().any(|e| e == ext))
    }

    fn read_package(&self, unit: &SourceUnit) -> Result<String, ExtractError> {
        let tree = self.parse_tree(unit)?;
        Ok(package_of(tree.root_node(), &unit.text))
    }

    fn extract(&self, unit: &SourceUnit) -> Result<Extraction, ExtractError> {
        let tree = self.parse_tree(unit)?;
        let root = tree.root_node();
        if root.has_error() {
            debug!("{} has syntax errors, extracting what parsed", unit.path.display());
        }

        let package = package_of(root, &unit.text);
        let file = unit.path_key();
        let mut collector = DeclarationCollector {
            source: &unit.text,
            package: &package,
            file: &file,
            declarations: Vec::new(),
        };
        let mut cursor = root.walk();
        collector.walk_tree(&mut cursor, None);
        let declarations = collector.declarations;

        debug!("Extracted {} declarations from {}", declarations.len(), file);
        Ok(Extraction {
            record: unit.record(package).into_indexed(),
            declarations,
        })
    }
}

/// Package named by the file header, empty for the default package
fn package_of(root: Node, source: &str) -> String {
    let mut cursor = root.walk();
    let Some(header) = root.children(&mut cursor).find(|n| n.kind() == "package_header") else {
        return String::new();
    };
    let text = node_text(header, source).trim_start();
    let name = text.strip_prefix("package").unwrap_or(text);
    name.split(|c: char| c == ';' || c == '\n')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '`')
        .collect()
}

fn node_text<'s>(node: Node, source: &'s str) -> &'s str {
    source.get(node.start_byte()..node.end_byte()).unwrap_or_default()
}

/// Source text with runs of whitespace collapsed to one space
fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn span(node: Node) -> Span {
    Span::new(node.start_byte(), node.end_byte())
}

fn name_node(node: Node) -> Option<Node> {
    if let Some(name) = node.child_by_field_name("name") {
        return Some(name);
    }
    let mut cursor = node.walk();
    let found = node.named_children(&mut cursor).find(|n| NAME_KINDS.contains(&n.kind()));
    found
}

/// The type written after the first direct `:` child of `node`
fn type_after_colon(node: Node, source: &str) -> String {
    let mut cursor = node.walk();
    let mut after_colon = false;
    for child in node.children(&mut cursor) {
        if child.kind() == ":" {
            after_colon = true;
        } else if after_colon && child.is_named() {
            return collapse(node_text(child, source));
        }
    }
    String::new()
}

fn is_binding_keyword(node: Node) -> bool {
    matches!(node.kind(), "val" | "var" | "binding_pattern_kind")
}

fn class_kind(node: Node, source: &str) -> ClassKind {
    if node.kind() != "class_declaration" {
        return ClassKind::Object;
    }

    let mut modifiers = "";
    let mut interface = false;
    let mut enum_class = false;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "modifiers" => modifiers = node_text(child, source),
            "interface" => interface = true,
            "enum" | "enum_class_body" => enum_class = true,
            _ => {}
        }
    }

    let has = |m: &str| modifiers.split_whitespace().any(|w| w == m);
    if interface {
        ClassKind::Interface
    } else if enum_class || has("enum") {
        ClassKind::EnumClass
    } else if has("annotation") {
        ClassKind::AnnotationClass
    } else if has("abstract") || has("sealed") {
        ClassKind::AbstractClass
    } else {
        ClassKind::Class
    }
}

struct DeclarationCollector<'a> {
    source: &'a str,
    package: &'a str,
    file: &'a str,
    declarations: Vec<Declaration>,
}

impl<'a> DeclarationCollector<'a> {
    fn walk_tree(&mut self, cursor: &mut TreeCursor, owner: Option<&str>) {
        let node = cursor.node();

        match node.kind() {
            "class_declaration" | "object_declaration" | "companion_object" => self.extract_class(node, owner),
            "function_declaration" => self.extract_function(node, owner),
            "property_declaration" => self.extract_property(node, owner),
            "enum_entry" => {
                if let Some(owner) = owner {
                    self.extract_enum_entry(node, owner);
                }
            }
            kind if CONTAINERS.contains(&kind) => {
                if cursor.goto_first_child() {
                    loop {
                        self.walk_tree(cursor, owner);
                        if !cursor.goto_next_sibling() {
                            break;
                        }
                    }
                    cursor.goto_parent();
                }
            }
            _ => {}
        }
    }

    fn text(&self, node: Node) -> &'a str {
        node_text(node, self.source)
    }

    fn qualify(&self, owner: Option<&str>, name: &str) -> String {
        match owner {
            Some(owner) => format!("{}.{}", owner, name),
            None if self.package.is_empty() => name.to_string(),
            None => format!("{}.{}", self.package, name),
        }
    }

    fn push(&mut self, name: &str, fq_name: String, span: Span, kind: DeclarationKind) {
        self.declarations.push(Declaration {
            name: name.to_string(),
            fq_name,
            file: self.file.to_string(),
            span,
            kind,
        });
    }

    /// Receiver written between the declaration head and its name, without the trailing `.`
    fn receiver(&self, head_end: usize, name_start: usize) -> String {
        let between = self.source.get(head_end..name_start).unwrap_or_default().trim();
        between
            .strip_suffix('.')
            .map(collapse)
            .unwrap_or_default()
    }

    fn extract_class(&mut self, node: Node, owner: Option<&str>) {
        let name = match name_node(node) {
            Some(name) => self.text(name),
            None if node.kind() == "companion_object" => "Companion",
            None => return,
        };
        let fq_name = self.qualify(owner, name);
        let class_kind = class_kind(node, self.source);
        self.push(name, fq_name.clone(), span(node), DeclarationKind::Class { class_kind });

        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            match child.kind() {
                "primary_constructor" => self.extract_constructor_properties(child, &fq_name),
                "class_body" | "enum_class_body" => {
                    let mut body = child.walk();
                    self.walk_tree(&mut body, Some(fq_name.as_str()));
                }
                _ => {}
            }
        }
    }

    /// `val`/`var` parameters of a primary constructor
    fn extract_constructor_properties(&mut self, constructor: Node, class_fq_name: &str) {
        let mut parameters = Vec::new();
        let mut cursor = constructor.walk();
        for child in constructor.named_children(&mut cursor) {
            match child.kind() {
                "class_parameter" => parameters.push(child),
                "class_parameters" => {
                    let mut inner = child.walk();
                    parameters.extend(child.named_children(&mut inner).filter(|n| n.kind() == "class_parameter"));
                }
                _ => {}
            }
        }

        for parameter in parameters {
            let mut cursor = parameter.walk();
            if !parameter.children(&mut cursor).any(is_binding_keyword) {
                continue;
            }
            let Some(name) = name_node(parameter).map(|n| self.text(n)) else {
                continue;
            };
            self.push(
                name,
                format!("{}.{}", class_fq_name, name),
                span(parameter),
                DeclarationKind::Field {
                    type_: type_after_colon(parameter, self.source),
                    enclosing_type: class_fq_name.to_string(),
                },
            );
        }
    }

    fn extract_function(&mut self, node: Node, owner: Option<&str>) {
        let Some(name_node) = name_node(node) else {
            return;
        };
        let name = self.text(name_node);

        let mut head_end = node.start_byte();
        let mut parameters = Vec::new();
        let mut after_parameters = false;
        let mut after_colon = false;
        let mut return_type = None;
        let mut expression_body = false;

        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.start_byte() < name_node.start_byte() {
                if matches!(child.kind(), "fun" | "type_parameters") {
                    head_end = child.end_byte();
                }
                continue;
            }
            match child.kind() {
                "function_value_parameters" => {
                    parameters = self.parameters(child);
                    after_parameters = true;
                }
                ":" if after_parameters => after_colon = true,
                "=" if after_parameters => expression_body = true,
                "function_body" => expression_body |= self.text(child).starts_with('='),
                _ if after_colon && return_type.is_none() && child.is_named() => {
                    return_type = Some(collapse(self.text(child)));
                }
                _ => {}
            }
        }

        // Expression bodies without a declared type are left unrendered
        let return_type = return_type.unwrap_or_else(|| {
            if expression_body {
                String::new()
            } else {
                "Unit".to_string()
            }
        });

        let fq_name = self.qualify(owner, name);
        self.push(
            name,
            fq_name,
            span(node),
            DeclarationKind::Function {
                parameters,
                return_type,
                enclosing_type: owner.unwrap_or_default().to_string(),
                receiver_type: self.receiver(head_end, name_node.start_byte()),
            },
        );
    }

    fn parameters(&self, list: Node) -> Vec<Parameter> {
        let mut cursor = list.walk();
        list.named_children(&mut cursor)
            .filter(|n| n.kind() == "parameter")
            .filter_map(|parameter| {
                Some(Parameter {
                    name: self.text(name_node(parameter)?).to_string(),
                    type_: type_after_colon(parameter, self.source),
                })
            })
            .collect()
    }

    fn extract_property(&mut self, node: Node, owner: Option<&str>) {
        let mut head_end = None;
        let mut variable = None;
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if variable.is_some() {
                break;
            }
            match child.kind() {
                "type_parameters" => head_end = Some(child.end_byte()),
                "variable_declaration" => variable = Some(child),
                // Destructuring declarations name no single property
                "multi_variable_declaration" => return,
                _ if is_binding_keyword(child) => head_end = Some(child.end_byte()),
                _ => {}
            }
        }
        let (Some(head_end), Some(variable)) = (head_end, variable) else {
            return;
        };
        let Some(name) = name_node(variable).map(|n| self.text(n)) else {
            return;
        };

        let receiver = self.receiver(head_end, variable.start_byte());
        let enclosing_type = if receiver.is_empty() {
            owner.unwrap_or_default().to_string()
        } else {
            receiver
        };
        let fq_name = self.qualify(owner, name);
        self.push(
            name,
            fq_name,
            span(node),
            DeclarationKind::Field {
                type_: type_after_colon(variable, self.source),
                enclosing_type,
            },
        );
    }

    fn extract_enum_entry(&mut self, node: Node, enum_fq_name: &str) {
        let Some(name) = name_node(node).map(|n| self.text(n)) else {
            return;
        };
        self.push(
            name,
            format!("{}.{}", enum_fq_name, name),
            span(node),
            DeclarationKind::EnumEntry {
                enum_fq_name: enum_fq_name.to_string(),
            },
        );
    }
}
