//! Syntax-tree checks for submitted scripts.
//!
//! Uses the tree-sitter Python grammar to confirm that a script parses and
//! that it defines the entry function with at least one `return` somewhere in
//! its body. The tree is walked breadth-first with an explicit queue, so deeply
//! nested input cannot overflow the stack.

use std::collections::VecDeque;

use tree_sitter::{Node, Parser, Tree};

/// Python 2 statement forms the grammar still accepts but Python 3 rejects.
const LEGACY_STATEMENTS: &[(&str, &str)] = &[
    ("print_statement", "print"),
    ("exec_statement", "exec"),
];

/// Violations detected by the syntax-tree checks.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AstViolation {
    /// The script does not parse.
    ParseError(String),
    /// No (synchronous) function with the entry name is defined.
    MissingEntryFunction,
    /// The entry function contains no `return` statement.
    MissingReturn,
}

impl std::fmt::Display for AstViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParseError(msg) => write!(f, "parse error: {msg}"),
            Self::MissingEntryFunction => write!(f, "entry function not defined"),
            Self::MissingReturn => write!(f, "entry function has no return statement"),
        }
    }
}

/// Parse `source` and verify the entry function requirements.
///
/// The first definition named `entry` in breadth-first order is the one whose
/// body is checked for a `return`, mirroring how Python's own `ast.walk`
/// would find it. `async def` definitions are ignored since the harness calls
/// the entry function synchronously.
pub fn validate_ast(source: &str, entry: &str) -> Result<(), AstViolation> {
    let tree = parse(source)?;
    let root = tree.root_node();

    if root.has_error() {
        return Err(AstViolation::ParseError(describe_first_error(root)));
    }
    if let Some(legacy) = find_legacy_statement(root) {
        return Err(AstViolation::ParseError(legacy));
    }

    let function = find_entry_function(root, source.as_bytes(), entry)
        .ok_or(AstViolation::MissingEntryFunction)?;

    let body = function.child_by_field_name("body").unwrap_or(function);
    if !subtree_contains(body, "return_statement") {
        return Err(AstViolation::MissingReturn);
    }

    Ok(())
}

fn parse(source: &str) -> Result<Tree, AstViolation> {
    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_python::language())
        .map_err(|e| AstViolation::ParseError(format!("grammar unavailable: {e:?}")))?;
    parser
        .parse(source, None)
        .ok_or_else(|| AstViolation::ParseError("parser produced no tree".into()))
}

/// Locate the first ERROR or MISSING node and render a position for it.
fn describe_first_error(root: Node<'_>) -> String {
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        if node.is_missing() {
            let pos = node.start_position();
            return format!(
                "expected '{}' at line {}, column {}",
                node.kind(),
                pos.row + 1,
                pos.column + 1
            );
        }
        if node.is_error() {
            let pos = node.start_position();
            return format!(
                "invalid syntax at line {}, column {}",
                pos.row + 1,
                pos.column + 1
            );
        }
        if node.has_error() {
            enqueue_children(node, &mut queue);
        }
    }
    "invalid syntax".to_string()
}

fn find_legacy_statement(root: Node<'_>) -> Option<String> {
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        if let Some((_, keyword)) = LEGACY_STATEMENTS.iter().find(|(kind, _)| *kind == node.kind()) {
            let pos = node.start_position();
            return Some(format!(
                "'{keyword}' statement is not valid Python 3, call {keyword}() instead (line {}, column {})",
                pos.row + 1,
                pos.column + 1
            ));
        }
        enqueue_children(node, &mut queue);
    }
    None
}

fn find_entry_function<'tree>(
    root: Node<'tree>,
    source: &[u8],
    entry: &str,
) -> Option<Node<'tree>> {
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        if node.kind() == "function_definition" && !is_async(node) {
            let name = node
                .child_by_field_name("name")
                .and_then(|n| n.utf8_text(source).ok());
            if name == Some(entry) {
                return Some(node);
            }
        }
        enqueue_children(node, &mut queue);
    }
    None
}

fn is_async(function: Node<'_>) -> bool {
    function.child(0).is_some_and(|first| first.kind() == "async")
}

fn subtree_contains(root: Node<'_>, kind: &str) -> bool {
    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        if node.kind() == kind {
            return true;
        }
        enqueue_children(node, &mut queue);
    }
    false
}

fn enqueue_children<'tree>(node: Node<'tree>, queue: &mut VecDeque<Node<'tree>>) {
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            queue.push_back(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_minimal_entry_function() {
        let src = "def main():\n    return {'ok': True}\n";
        assert_eq!(validate_ast(src, "main"), Ok(()));
    }

    #[test]
    fn accepts_nested_entry_function() {
        let src = "class Job:\n    def main(self):\n        return 1\n";
        assert_eq!(validate_ast(src, "main"), Ok(()));
    }

    #[test]
    fn accepts_return_on_only_one_branch() {
        let src = "def main():\n    if False:\n        return 1\n    print('fell through')\n";
        assert_eq!(validate_ast(src, "main"), Ok(()));
    }

    #[test]
    fn accepts_return_inside_nested_helper() {
        // Any return in the subtree satisfies the check.
        let src = "def main():\n    def helper():\n        return 2\n    helper()\n";
        assert_eq!(validate_ast(src, "main"), Ok(()));
    }

    #[test]
    fn accepts_decorated_entry_function() {
        let src = "import functools\n\n@functools.lru_cache\ndef main():\n    return 3\n";
        assert_eq!(validate_ast(src, "main"), Ok(()));
    }

    #[test]
    fn rejects_missing_entry_function() {
        let src = "print('No main function')\n";
        assert_eq!(
            validate_ast(src, "main"),
            Err(AstViolation::MissingEntryFunction)
        );
    }

    #[test]
    fn rejects_similarly_named_function() {
        let src = "def main_helper():\n    return 1\n";
        assert_eq!(
            validate_ast(src, "main"),
            Err(AstViolation::MissingEntryFunction)
        );
    }

    #[test]
    fn rejects_async_entry_function() {
        let src = "async def main():\n    return 1\n";
        assert_eq!(
            validate_ast(src, "main"),
            Err(AstViolation::MissingEntryFunction)
        );
    }

    #[test]
    fn rejects_entry_function_without_return() {
        let src = "def main():\n    print('hi')\n";
        assert_eq!(validate_ast(src, "main"), Err(AstViolation::MissingReturn));
    }

    #[test]
    fn return_elsewhere_does_not_count() {
        let src = "def other():\n    return 1\n\ndef main():\n    other()\n";
        assert_eq!(validate_ast(src, "main"), Err(AstViolation::MissingReturn));
    }

    #[test]
    fn honours_custom_entry_name() {
        let src = "def handler():\n    return 1\n";
        assert_eq!(validate_ast(src, "handler"), Ok(()));
        assert_eq!(
            validate_ast(src, "main"),
            Err(AstViolation::MissingEntryFunction)
        );
    }

    #[test]
    fn syntax_error_reports_position() {
        let src = "def main(:\n    return 1\n";
        match validate_ast(src, "main") {
            Err(AstViolation::ParseError(msg)) => {
                assert!(msg.contains("line 1"), "expected a line number: {msg}");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn python2_print_statement_is_a_syntax_error() {
        let src = "def main():\n    print \"hi\"\n    return 1\n";
        match validate_ast(src, "main") {
            Err(AstViolation::ParseError(msg)) => {
                assert!(msg.contains("'print' statement"), "{msg}");
                assert!(msg.contains("line 2, column 5"), "{msg}");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn python2_exec_statement_is_a_syntax_error() {
        let src = "def main():\n    exec \"x = 1\"\n    return 1\n";
        assert!(matches!(
            validate_ast(src, "main"),
            Err(AstViolation::ParseError(_))
        ));
    }

    #[test]
    fn print_call_is_accepted() {
        let src = "def main():\n    print(\"hi\")\n    print(1, 2, sep=\"-\")\n    return 1\n";
        assert_eq!(validate_ast(src, "main"), Ok(()));
    }

    #[test]
    fn syntax_error_takes_precedence_over_missing_entry() {
        let src = "x = (1, 2\n";
        assert!(matches!(
            validate_ast(src, "main"),
            Err(AstViolation::ParseError(_))
        ));
    }

    #[test]
    fn deeply_nested_input_does_not_overflow() {
        let depth = 2_000;
        let src = format!(
            "def main():\n    return {}1{}\n",
            "(".repeat(depth),
            ")".repeat(depth)
        );
        // Either outcome is acceptable; the walk must simply terminate.
        let _ = validate_ast(&src, "main");
    }
}
