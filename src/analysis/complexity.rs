//! Complexity scoring
//!
//! 1 + control-flow keywords + definitions + a nesting-depth term.

use lazy_static::lazy_static;
use regex::Regex;

/// Scores above this add a low-severity review violation
pub const COMPLEXITY_THRESHOLD: u32 = 50;

/// Indentation columns per nesting level
const INDENT_WIDTH: usize = 4;

lazy_static! {
    static ref CONTROL_KEYWORDS: Regex = Regex::new(
        r"\b(if|elif|else|for|while|try|except|finally|with|switch|case|catch)\b"
    )
    .unwrap_or_else(|e| panic!("invalid control keyword pattern: {}", e));
    static ref DEFINITIONS: Regex = Regex::new(r"\b(def|class|function)\b")
        .unwrap_or_else(|e| panic!("invalid definition pattern: {}", e));
}

/// Deepest indentation level among non-blank lines
fn max_nesting(code: &str) -> usize {
    code.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let columns: usize = line
                .chars()
                .take_while(|c| *c == ' ' || *c == '\t')
                .map(|c| if c == '\t' { INDENT_WIDTH } else { 1 })
                .sum();
            columns / INDENT_WIDTH
        })
        .max()
        .unwrap_or(0)
}

/// Compute the complexity score of a source text
pub fn score(code: &str) -> u32 {
    let control = CONTROL_KEYWORDS.find_iter(code).count();
    let definitions = DEFINITIONS.find_iter(code).count();
    let nesting = max_nesting(code);

    let total = 1 + control + definitions + 2 * nesting;
    u32::try_from(total).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline() {
        assert_eq!(score(""), 1);
        assert_eq!(score("x = 1"), 1);
    }

    #[test]
    fn test_keywords_are_word_bounded() {
        // `elif` counts once, `iffy` and `notify` not at all
        assert_eq!(score("iffy = notify"), 1);
        assert_eq!(score("elif"), 2);
    }

    #[test]
    fn test_function_with_branch() {
        let code = "def f(x):\n    if x:\n        return 1\n    else:\n        return 2\n";
        // def + if + else + nesting depth 2
        assert_eq!(score(code), 1 + 1 + 2 + 4);
    }

    #[test]
    fn test_tabs_count_as_one_level() {
        assert_eq!(max_nesting("a\n\tb\n\t\tc\n"), 2);
        assert_eq!(max_nesting("  two spaces\n"), 0);
    }

    #[test]
    fn test_threshold_reachable() {
        let code = "if x:\n    pass\n".repeat(60);
        assert!(score(&code) > COMPLEXITY_THRESHOLD);
    }
}
