//! Structural analysis over a Python syntax tree
//!
//! The source is parsed once with tree-sitter, every node is collected in
//! document order, and a fixed, ordered list of named checks runs over that
//! node list. A parse error aborts the structural pass as a whole.

use tree_sitter::{Node, Parser};

use super::assessment::{Category, Severity, Violation};
use crate::error::GatewayError;

/// Dangerous builtins and the severity of calling them
const DANGEROUS_FUNCTIONS: &[(&str, Severity)] = &[
    ("eval", Severity::Critical),
    ("exec", Severity::Critical),
    ("compile", Severity::High),
    ("__import__", Severity::High),
    ("getattr", Severity::Medium),
    ("setattr", Severity::Medium),
    ("delattr", Severity::Medium),
];

/// Sensitive top-level modules and the severity of importing them
const SENSITIVE_MODULES: &[(&str, Severity)] = &[
    ("os", Severity::Medium),
    ("subprocess", Severity::Medium),
    ("socket", Severity::Medium),
    ("urllib", Severity::Medium),
    ("requests", Severity::Medium),
    ("pickle", Severity::Low),
    ("marshal", Severity::Low),
    ("ctypes", Severity::High),
];

/// Module roots whose calls construct network traffic
const NETWORK_ROOTS: &[&str] = &["urllib", "requests", "socket", "http", "httpx", "aiohttp"];

/// Parsed source plus its nodes in document order
pub struct SyntaxContext<'a> {
    source: &'a str,
    nodes: Vec<Node<'a>>,
}

impl<'a> SyntaxContext<'a> {
    fn text(&self, node: Node<'_>) -> &'a str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    fn calls(&self) -> impl Iterator<Item = &Node<'a>> {
        self.nodes.iter().filter(|n| n.kind() == "call")
    }
}

/// A named structural check
pub type StructuralCheck = fn(&SyntaxContext<'_>) -> Vec<Violation>;

/// Checks run in this order; results are concatenated
pub const STRUCTURAL_CHECKS: &[(&str, StructuralCheck)] = &[
    ("dangerous_functions", dangerous_functions),
    ("sensitive_imports", sensitive_imports),
    ("string_interpolation", string_interpolation),
    ("file_operations", file_operations),
    ("network_calls", network_calls),
];

/// Source could not be parsed into a clean tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    /// 1-based line of the first error node
    pub line: Option<usize>,
    pub reason: String,
}

impl ParseFailure {
    /// The single violation reported in place of structural results
    pub fn to_violation(&self) -> Violation {
        Violation {
            severity: Severity::Medium,
            category: Category::Syntax,
            description: "Source failed to parse, possible obfuscation".to_string(),
            line: self.line,
            suggestion: "Submit syntactically valid source".to_string(),
            rule: "structural:parse".to_string(),
        }
    }
}

impl From<ParseFailure> for GatewayError {
    fn from(failure: ParseFailure) -> Self {
        GatewayError::AnalysisFailure(failure.reason)
    }
}

/// Parse Python source and run every structural check
pub fn analyze(source: &str) -> Result<Vec<Violation>, ParseFailure> {
    let mut parser = Parser::new();
    let language: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
    parser.set_language(&language).map_err(|e| ParseFailure {
        line: None,
        reason: format!("grammar unavailable: {}", e),
    })?;

    let tree = parser.parse(source, None).ok_or_else(|| ParseFailure {
        line: None,
        reason: "parser returned no tree".to_string(),
    })?;

    let nodes = collect_nodes(tree.root_node());

    if tree.root_node().has_error() {
        let line = nodes
            .iter()
            .find(|n| n.is_error() || n.is_missing())
            .map(line_of);
        return Err(ParseFailure {
            line,
            reason: format!("syntax error near line {}", line.unwrap_or(0)),
        });
    }

    let ctx = SyntaxContext { source, nodes };
    Ok(STRUCTURAL_CHECKS
        .iter()
        .flat_map(|(_, check)| check(&ctx))
        .collect())
}

/// Pre-order walk without recursion
fn collect_nodes(root: Node<'_>) -> Vec<Node<'_>> {
    let mut nodes = Vec::new();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        nodes.push(node);
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }

    nodes
}

fn line_of(node: &Node<'_>) -> usize {
    node.start_position().row + 1
}

/// Leftmost identifier of an attribute chain like `a.b.c`
fn root_identifier<'a>(node: Node<'a>) -> Option<Node<'a>> {
    let mut current = node;
    loop {
        match current.kind() {
            "identifier" => return Some(current),
            "attribute" => current = current.child_by_field_name("object")?,
            "call" => current = current.child_by_field_name("function")?,
            _ => return None,
        }
    }
}

fn violation(
    check: &str,
    node: &Node<'_>,
    severity: Severity,
    category: Category,
    description: String,
    suggestion: String,
) -> Violation {
    Violation {
        severity,
        category,
        description,
        line: Some(line_of(node)),
        suggestion,
        rule: format!("structural:{}", check),
    }
}

fn dangerous_functions(ctx: &SyntaxContext<'_>) -> Vec<Violation> {
    ctx.calls()
        .filter_map(|call| {
            let func = call.child_by_field_name("function")?;
            if func.kind() != "identifier" {
                return None;
            }
            let name = ctx.text(func);
            let (_, severity) = DANGEROUS_FUNCTIONS.iter().find(|(f, _)| *f == name)?;
            Some(violation(
                "dangerous_functions",
                call,
                *severity,
                Category::DangerousFunction,
                format!("Use of dangerous function: {}", name),
                format!("Avoid using {}", name),
            ))
        })
        .collect()
}

fn sensitive_imports(ctx: &SyntaxContext<'_>) -> Vec<Violation> {
    let mut violations = Vec::new();

    for node in &ctx.nodes {
        let modules: Vec<Node<'_>> = match node.kind() {
            "import_statement" => {
                let mut cursor = node.walk();
                let names = node
                    .children_by_field_name("name", &mut cursor)
                    .filter_map(|n| match n.kind() {
                        "aliased_import" => n.child_by_field_name("name"),
                        _ => Some(n),
                    })
                    .collect();
                names
            }
            "import_from_statement" => node.child_by_field_name("module_name").into_iter().collect(),
            _ => continue,
        };

        for module in modules {
            let root = ctx.text(module).trim_start_matches('.').split('.').next().unwrap_or("");
            if let Some((name, severity)) = SENSITIVE_MODULES.iter().find(|(m, _)| *m == root) {
                violations.push(violation(
                    "sensitive_imports",
                    node,
                    *severity,
                    Category::SuspiciousImport,
                    format!("Import of sensitive module: {}", name),
                    format!("Review usage of the {} module", name),
                ));
            }
        }
    }

    violations
}

fn string_interpolation(ctx: &SyntaxContext<'_>) -> Vec<Violation> {
    let mut violations = Vec::new();

    for node in &ctx.nodes {
        match node.kind() {
            "call" => {
                let is_format = node
                    .child_by_field_name("function")
                    .filter(|f| f.kind() == "attribute")
                    .and_then(|f| f.child_by_field_name("attribute"))
                    .map(|attr| ctx.text(attr) == "format")
                    .unwrap_or(false);
                if is_format {
                    violations.push(violation(
                        "string_interpolation",
                        node,
                        Severity::Low,
                        Category::StringInjection,
                        "String formatting may be vulnerable to injection".to_string(),
                        "Validate and sanitize format arguments".to_string(),
                    ));
                }
            }
            "string" if has_interpolation(node) => {
                violations.push(violation(
                    "string_interpolation",
                    node,
                    Severity::Low,
                    Category::StringInjection,
                    "Interpolated string may embed untrusted values".to_string(),
                    "Validate values interpolated into strings".to_string(),
                ));
            }
            _ => {}
        }
    }

    violations
}

fn has_interpolation(node: &Node<'_>) -> bool {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).any(|c| c.kind() == "interpolation");
    found
}

/// Literal text of a plain (non-interpolated) string node
fn literal_text(ctx: &SyntaxContext<'_>, node: Node<'_>) -> Option<String> {
    if node.kind() != "string" || has_interpolation(&node) {
        return None;
    }
    let mut cursor = node.walk();
    let text = node
        .children(&mut cursor)
        .filter(|c| c.kind() == "string_content")
        .map(|c| ctx.text(c))
        .collect();
    Some(text)
}

fn file_operations(ctx: &SyntaxContext<'_>) -> Vec<Violation> {
    ctx.calls()
        .filter_map(|call| {
            let func = call.child_by_field_name("function")?;
            if func.kind() != "identifier" || ctx.text(func) != "open" {
                return None;
            }
            let first_arg = call.child_by_field_name("arguments")?.named_child(0)?;
            let path = literal_text(ctx, first_arg)?;
            if !(path.contains("..") || path.starts_with('/')) {
                return None;
            }
            Some(violation(
                "file_operations",
                call,
                Severity::High,
                Category::PathTraversal,
                format!("Potential path traversal in file operation: {}", path),
                "Validate and sanitize file paths".to_string(),
            ))
        })
        .collect()
}

fn network_calls(ctx: &SyntaxContext<'_>) -> Vec<Violation> {
    ctx.calls()
        .filter_map(|call| {
            let func = call.child_by_field_name("function")?;
            if func.kind() != "attribute" {
                return None;
            }
            let root = ctx.text(root_identifier(func)?);
            if !NETWORK_ROOTS.contains(&root) {
                return None;
            }
            Some(violation(
                "network_calls",
                call,
                Severity::Medium,
                Category::NetworkAccess,
                format!("Network call via {}", ctx.text(func)),
                "Restrict network access to known endpoints".to_string(),
            ))
        })
        .collect()
}
