//! Pattern rule table
//!
//! A fixed, enumerated table of textual rules matched against raw source.
//! Rules are language independent and compiled once. The `regex` crate
//! guarantees linear-time matching, so no input can trigger pathological
//! backtracking.

use lazy_static::lazy_static;
use regex::Regex;

use super::assessment::{Category, Severity, Violation};

/// A single textual rule
#[derive(Debug, Clone, Copy)]
pub struct PatternRule {
    /// Stable identifier recorded on each violation
    pub id: &'static str,
    pub pattern: &'static str,
    pub severity: Severity,
    pub category: Category,
    pub description: &'static str,
    pub suggestion: &'static str,
}

/// The rule table, evaluated in order
pub const PATTERN_RULES: &[PatternRule] = &[
    PatternRule {
        id: "os_system",
        pattern: r"\bos\.system\s*\(",
        severity: Severity::Critical,
        category: Category::System,
        description: "Direct system command execution",
        suggestion: "Use subprocess with an explicit argument list instead",
    },
    PatternRule {
        id: "eval",
        pattern: r"\beval\s*\(",
        severity: Severity::Critical,
        category: Category::Injection,
        description: "Dynamic code evaluation",
        suggestion: "Avoid eval() and use a specific parser",
    },
    PatternRule {
        id: "exec",
        pattern: r"\bexec\s*\(",
        severity: Severity::Critical,
        category: Category::Injection,
        description: "Dynamic code execution",
        suggestion: "Avoid exec() and use a specific parser",
    },
    PatternRule {
        id: "shell_true",
        pattern: r"subprocess\.(call|run|Popen|check_output|check_call)\s*\([^)]*shell\s*=\s*True",
        severity: Severity::High,
        category: Category::System,
        description: "Shell command execution with shell=True",
        suggestion: "Use shell=False and pass arguments as a list",
    },
    PatternRule {
        id: "dynamic_import",
        pattern: r"__import__\s*\(",
        severity: Severity::High,
        category: Category::Injection,
        description: "Dynamic module import",
        suggestion: "Use static imports",
    },
    PatternRule {
        id: "compile",
        pattern: r"\bcompile\s*\(",
        severity: Severity::High,
        category: Category::Injection,
        description: "Dynamic code compilation",
        suggestion: "Avoid compiling code at runtime",
    },
    PatternRule {
        id: "open_traversal",
        pattern: r#"\bopen\s*\(\s*['"][^'"\n]*\.\./"#,
        severity: Severity::High,
        category: Category::FileAccess,
        description: "Path traversal attempt in file access",
        suggestion: "Validate and sanitize file paths",
    },
    PatternRule {
        id: "import_os",
        pattern: r"\bimport\s+os\b",
        severity: Severity::Medium,
        category: Category::System,
        description: "Operating system module imported",
        suggestion: "Review operating system access requirements",
    },
    PatternRule {
        id: "import_subprocess",
        pattern: r"\bimport\s+subprocess\b",
        severity: Severity::Medium,
        category: Category::System,
        description: "Subprocess module imported",
        suggestion: "Review subprocess usage",
    },
    PatternRule {
        id: "import_http",
        pattern: r"\bimport\s+(urllib|requests|httplib)\b",
        severity: Severity::Medium,
        category: Category::Network,
        description: "Network access module imported",
        suggestion: "Review network access requirements",
    },
    PatternRule {
        id: "import_socket",
        pattern: r"\bimport\s+socket\b",
        severity: Severity::Medium,
        category: Category::Network,
        description: "Socket module imported",
        suggestion: "Review socket usage",
    },
    PatternRule {
        id: "import_pickle",
        pattern: r"\bimport\s+pickle\b",
        severity: Severity::Low,
        category: Category::Serialization,
        description: "Pickle can execute arbitrary code on load",
        suggestion: "Prefer JSON or another data-only format",
    },
    PatternRule {
        id: "input",
        pattern: r"\binput\s*\(",
        severity: Severity::Low,
        category: Category::Input,
        description: "User input read without validation",
        suggestion: "Validate and sanitize user input",
    },
    PatternRule {
        id: "child_process",
        pattern: r#"require\s*\(\s*['"](node:)?child_process['"]\s*\)"#,
        severity: Severity::High,
        category: Category::System,
        description: "Node child_process module required",
        suggestion: "Avoid spawning processes from scripts",
    },
    PatternRule {
        id: "rm_root",
        pattern: r"(?m)\brm\s+-[a-z]*r[a-z]*\s+/(\*|\s|$)",
        severity: Severity::Critical,
        category: Category::System,
        description: "Recursive removal from the filesystem root",
        suggestion: "Never remove paths rooted at /",
    },
    PatternRule {
        id: "pipe_to_shell",
        pattern: r"\b(curl|wget)\b[^\n|]*\|\s*(sudo\s+)?(sh|bash)\b",
        severity: Severity::High,
        category: Category::Network,
        description: "Remote script piped into a shell",
        suggestion: "Download, verify and review scripts before running them",
    },
    PatternRule {
        id: "function_constructor",
        pattern: r"\bnew\s+Function\s*\(",
        severity: Severity::High,
        category: Category::Injection,
        description: "Function constructor evaluates a string as code",
        suggestion: "Avoid constructing functions from strings",
    },
];

lazy_static! {
    static ref COMPILED_RULES: Vec<(PatternRule, Regex)> = PATTERN_RULES
        .iter()
        .map(|rule| {
            let regex = Regex::new(&format!("(?i){}", rule.pattern))
                .unwrap_or_else(|e| panic!("invalid pattern rule {}: {}", rule.id, e));
            (*rule, regex)
        })
        .collect();
}

/// Byte offsets at which each line starts
pub(crate) fn line_starts(code: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(code.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// 1-based line number of a byte offset
pub(crate) fn line_of(starts: &[usize], offset: usize) -> usize {
    match starts.binary_search(&offset) {
        Ok(idx) => idx + 1,
        Err(idx) => idx,
    }
}

/// Run the pattern pass
///
/// Every match of every rule becomes a violation, in table order then
/// source order.
pub fn scan(code: &str) -> Vec<Violation> {
    let starts = line_starts(code);
    let mut violations = Vec::new();

    for (rule, regex) in COMPILED_RULES.iter() {
        for m in regex.find_iter(code) {
            violations.push(Violation {
                severity: rule.severity,
                category: rule.category,
                description: rule.description.to_string(),
                line: Some(line_of(&starts, m.start())),
                suggestion: rule.suggestion.to_string(),
                rule: format!("pattern:{}", rule.id),
            });
        }
    }

    violations
}
