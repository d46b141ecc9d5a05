//! Pre-execution validator for submitted scripts.
//!
//! This validator is **defense-in-depth**: the isolation launcher is the real
//! security boundary. The denylist is a case-insensitive substring heuristic.
//! It can be evaded (aliasing, building names from strings) and it can refuse
//! innocent code (a variable called `executor` contains `exec`). It exists to
//! turn away the obvious cases early with a clear message.

use crate::ast_validator::{validate_ast, AstViolation};
use crate::error::SandboxError;

/// Maximum script size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Entry function invoked by the harness unless configured otherwise.
pub const DEFAULT_ENTRY_FUNCTION: &str = "main";

/// Terms refused anywhere in the source text, checked in this order.
///
/// Covers command execution (`subprocess`, `os.system`), dynamic evaluation
/// (`eval`, `exec`) and dynamic import (`__import__`).
pub const DENYLIST: &[&str] = &["subprocess", "os.system", "eval", "exec", "__import__"];

/// Validates a submitted script before anything is executed.
///
/// Checks run in this order and the first failure wins: size and emptiness,
/// syntax, entry function presence, `return` presence, denylist.
pub fn validate_script(
    source: &str,
    entry_function: &str,
    max_size: Option<usize>,
) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    // 1. Size limit
    if source.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: source.len(),
        });
    }

    // 2. Empty script
    if source.trim().is_empty() {
        return Err(SandboxError::EmptyScript);
    }

    // 3. Structure
    validate_ast(source, entry_function).map_err(|violation| match violation {
        AstViolation::ParseError(detail) => SandboxError::Syntax { detail },
        AstViolation::MissingEntryFunction => SandboxError::MissingEntryFunction {
            name: entry_function.to_string(),
        },
        AstViolation::MissingReturn => SandboxError::MissingReturn {
            name: entry_function.to_string(),
        },
    })?;

    // 4. Denylist
    if let Some(term) = find_denylisted(source) {
        return Err(SandboxError::BannedPattern {
            term: term.to_string(),
        });
    }

    Ok(())
}

/// Returns the first denylist entry contained in `source`, ignoring case.
pub fn find_denylisted(source: &str) -> Option<&'static str> {
    let lowered = source.to_lowercase();
    DENYLIST
        .iter()
        .copied()
        .find(|term| lowered.contains(term))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(source: &str) -> Result<(), SandboxError> {
        validate_script(source, DEFAULT_ENTRY_FUNCTION, None)
    }

    #[test]
    fn accepts_hello_world() {
        let src = r#"
def main():
    return {"message": "Hello World", "status": "success"}
"#;
        assert!(validate(src).is_ok());
    }

    #[test]
    fn accepts_prints_and_imports() {
        let src = r#"
import math

def main():
    print("Starting calculation...")
    result = 2 + 2
    print(f"Result: {result}")
    return {"sum": result, "root": math.sqrt(result)}
"#;
        assert!(validate(src).is_ok());
    }

    #[test]
    fn rejects_empty_script() {
        assert!(matches!(validate(""), Err(SandboxError::EmptyScript)));
        assert!(matches!(validate("  \n\t"), Err(SandboxError::EmptyScript)));
    }

    #[test]
    fn rejects_oversized_script() {
        let big = format!("def main():\n    return 1\n#{}", "x".repeat(100_000));
        let err = validate(&big).unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { .. }));
    }

    #[test]
    fn custom_max_size() {
        let src = "def main():\n    return 1\n";
        assert!(validate_script(src, "main", Some(10)).is_err());
        assert!(validate_script(src, "main", Some(200)).is_ok());
    }

    #[test]
    fn rejects_missing_main() {
        let err = validate("print('No main function')").unwrap_err();
        assert!(err.to_string().contains("must define"), "{err}");
    }

    #[test]
    fn rejects_main_without_return() {
        let err = validate("def main():\n    x = 1\n").unwrap_err();
        assert!(matches!(err, SandboxError::MissingReturn { .. }));
        assert!(err.to_string().contains("return statement"));
    }

    #[test]
    fn rejects_syntax_error_with_diagnostic() {
        let err = validate("def main(:\n    return 1\n").unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { .. }));
        assert!(err.to_string().starts_with("syntax error in script:"));
    }

    #[test]
    fn rejects_subprocess_import() {
        let src = "def main():\n    import subprocess\n    return 'dangerous'\n";
        let err = validate(src).unwrap_err();
        assert_eq!(
            err.to_string(),
            "script contains potentially dangerous operation: subprocess"
        );
    }

    #[test]
    fn denylist_is_case_insensitive() {
        let src = "def main():\n    return 'OS.SYSTEM'\n";
        match validate(src) {
            Err(SandboxError::BannedPattern { term }) => assert_eq!(term, "os.system"),
            other => panic!("expected banned pattern, got {other:?}"),
        }
    }

    #[test]
    fn denylist_matches_inside_comments_and_strings() {
        let src = "# never call eval here\ndef main():\n    return 1\n";
        match validate(src) {
            Err(SandboxError::BannedPattern { term }) => assert_eq!(term, "eval"),
            other => panic!("expected banned pattern, got {other:?}"),
        }
    }

    #[test]
    fn denylist_reports_first_term_in_list_order() {
        // Both "exec" and "subprocess" appear; list order decides.
        let src = "def main():\n    exec('1')\n    return 'subprocess'\n";
        match validate(src) {
            Err(SandboxError::BannedPattern { term }) => assert_eq!(term, "subprocess"),
            other => panic!("expected banned pattern, got {other:?}"),
        }
    }

    #[test]
    fn denylist_over_matches_innocent_identifiers() {
        // Known limitation: substring matching refuses legitimate names.
        let src = "def main():\n    executor = 1\n    return executor\n";
        match validate(src) {
            Err(SandboxError::BannedPattern { term }) => assert_eq!(term, "exec"),
            other => panic!("expected banned pattern, got {other:?}"),
        }
    }

    #[test]
    fn structural_checks_run_before_denylist() {
        let err = validate("import subprocess\n").unwrap_err();
        assert!(matches!(err, SandboxError::MissingEntryFunction { .. }));
    }

    #[test]
    fn find_denylisted_returns_none_for_clean_source() {
        assert_eq!(find_denylisted("def main():\n    return 42\n"), None);
        assert_eq!(find_denylisted("__IMPORT__('os')"), Some("__import__"));
    }
}
