//! Redaction of host details and secrets from text that leaves the sandbox.
//!
//! Two concerns:
//! - harness stderr (Python tracebacks) names the staging directory; that is
//!   rewritten to `<sandbox>` before it reaches the caller;
//! - audit previews of submitted code must not persist credentials pasted
//!   into scripts.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Placeholder that replaces the staging directory path.
pub const SANDBOX_PLACEHOLDER: &str = "<sandbox>";

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(Bearer\s+[^\s'"]+|(api_key|token|password|secret)\s*=\s*['"]?[^\s'"]+['"]?)"#,
    )
    .unwrap()
});

/// AWS access key IDs.
static AWS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:AKIA|ABIA|ACCA|ASIA)[0-9A-Z]{16}").unwrap());

static PEM_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-----BEGIN[A-Z\s]+PRIVATE KEY-----[\s\S]*?-----END[A-Z\s]+PRIVATE KEY-----")
        .unwrap()
});

/// GitHub tokens: classic (ghp_, gho_, ...) and fine-grained (github_pat_).
static GITHUB_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:ghp_|gho_|ghs_|ghr_|github_pat_)[a-zA-Z0-9_]{20,}").unwrap());

static JWT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+").unwrap());

/// Replace every occurrence of `staging_dir` in `text` with [`SANDBOX_PLACEHOLDER`].
///
/// Both the path as given and its canonical form are replaced, since the
/// interpreter may report either (e.g. `/tmp` behind a symlink).
pub fn redact_staging_path(text: &str, staging_dir: &Path) -> String {
    let mut out = text.to_string();
    let mut forms = vec![staging_dir.to_string_lossy().into_owned()];
    if let Ok(canonical) = staging_dir.canonicalize() {
        forms.push(canonical.to_string_lossy().into_owned());
    }
    // Longest first so a canonical path containing the given one is not split.
    forms.sort_by_key(|f| std::cmp::Reverse(f.len()));
    for form in forms.iter().filter(|f| !f.is_empty()) {
        out = out.replace(form.as_str(), SANDBOX_PLACEHOLDER);
    }
    out
}

/// Replace credentials and private keys in `text` with `[REDACTED]`.
pub fn redact_secrets(text: &str) -> String {
    // Most specific first; the generic credential pattern would otherwise
    // consume part of a JWT or PEM block.
    let mut msg = PEM_KEY_RE.replace_all(text, "[REDACTED]").into_owned();
    msg = JWT_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = AWS_KEY_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = GITHUB_TOKEN_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = CREDENTIAL_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg
}
