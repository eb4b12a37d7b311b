//! Wire framing for the shared resource.
//!
//! The resource body is a running log whose last line is always the newest
//! directive. The agent replaces the whole body with
//! `history + "\n\nCommand output:\n" + output + "\n" + directive`, so the
//! directive stays last and the next reader finds it in the same place.

use std::borrow::Cow;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;

/// Header line that precedes captured command output.
pub const OUTPUT_HEADER: &str = "Command output:";

/// Replacement for credential-shaped runs in captured output.
pub const REDACTED: &str = "[REDACTED]";

/// Shortest run of token characters that gets redacted.
pub const REDACT_MIN_RUN: usize = 30;

static TOKEN_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_-]{30,}").unwrap());

/// Split `body` into `(history, directive)`.
///
/// The directive is the last line; a single trailing line terminator is ignored
/// so `"a\nb\n"` and `"a\nb"` both yield `("a", "b")`.
pub fn extract_directive(body: &str) -> (&str, &str) {
    let trimmed = strip_line_end(body);
    match trimmed.rfind('\n') {
        Some(idx) => (
            trimmed[..idx].strip_suffix('\r').unwrap_or(&trimmed[..idx]),
            &trimmed[idx + 1..],
        ),
        None => ("", trimmed),
    }
}

/// Build the body the agent commits after running `directive`.
///
/// Trailing newlines of the output are dropped, matching shell command
/// substitution, and the output is redacted before it is framed.
pub fn compose_result(history: &str, directive: &str, raw_output: &str) -> String {
    let output = raw_output.trim_end_matches(['\n', '\r']);
    let redacted = redact(output);
    let mut body = String::with_capacity(
        history.len() + OUTPUT_HEADER.len() + redacted.len() + directive.len() + 4,
    );
    body.push_str(history);
    body.push_str("\n\n");
    body.push_str(OUTPUT_HEADER);
    body.push('\n');
    body.push_str(&redacted);
    body.push('\n');
    body.push_str(directive);
    body
}

/// Append `directive` as the new trailing line of `body`.
pub fn append_directive(body: &str, directive: &str) -> String {
    if body.is_empty() {
        return directive.to_string();
    }
    let mut next = String::with_capacity(body.len() + directive.len() + 1);
    next.push_str(body);
    if !body.ends_with('\n') {
        next.push('\n');
    }
    next.push_str(directive);
    next
}

/// Replace every run of 30+ `[A-Za-z0-9_-]` characters with [`REDACTED`].
pub fn redact(output: &str) -> Cow<'_, str> {
    TOKEN_RUN_RE.replace_all(output, REDACTED)
}

/// Reject directives that would break last-line framing.
pub fn validate_directive(directive: &str) -> Result<&str> {
    if directive.contains(['\n', '\r']) {
        bail!("directive must be a single line");
    }
    let trimmed = directive.trim();
    if trimmed.is_empty() {
        bail!("directive is empty");
    }
    Ok(trimmed)
}

fn strip_line_end(body: &str) -> &str {
    let body = body.strip_suffix('\n').unwrap_or(body);
    body.strip_suffix('\r').unwrap_or(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_splits_last_line() {
        assert_eq!(
            extract_directive("notes\nmore notes\nuname -a"),
            ("notes\nmore notes", "uname -a")
        );
    }

    #[test]
    fn extract_ignores_one_trailing_newline() {
        assert_eq!(extract_directive("a\nb\n"), ("a", "b"));
        assert_eq!(extract_directive("a\r\nb\r\n"), ("a", "b"));
    }

    #[test]
    fn extract_single_line_has_empty_history() {
        assert_eq!(extract_directive("ls"), ("", "ls"));
        assert_eq!(extract_directive(""), ("", ""));
    }

    #[test]
    fn compose_matches_wire_layout() {
        let body = compose_result("notes", "echo hi", "hi\n");
        assert_eq!(body, "notes\n\nCommand output:\nhi\necho hi");
    }

    #[test]
    fn compose_then_extract_returns_directive_unchanged() {
        let cases = [
            ("", "ls -la", ""),
            ("history", "echo hi", "hi\n"),
            ("a\nb\n\nCommand output:\nold\nls", "cat /etc/hostname", "host\n\n\n"),
            ("x", "printf 'a\\nb'", "a\nb"),
            ("x", "  spaced  ", "out"),
        ];
        for (history, directive, output) in cases {
            let body = compose_result(history, directive, output);
            let (_, extracted) = extract_directive(&body);
            assert_eq!(extracted, directive, "history={history:?} output={output:?}");
        }
    }

    #[test]
    fn compose_keeps_history_before_output() {
        let body = compose_result("first\nsecond", "pwd", "/root");
        let (history, _) = extract_directive(&body);
        assert_eq!(history, "first\nsecond\n\nCommand output:\n/root");
    }

    #[test]
    fn redaction_replaces_runs_of_thirty_or_more() {
        let token = "ghp_".to_string() + &"A".repeat(36);
        let output = format!("token={token} done");
        let body = compose_result("", "env", &output);
        assert!(!body.contains(&token));
        assert!(body.contains("token=[REDACTED] done"));
    }

    #[test]
    fn redaction_boundary_is_thirty_characters() {
        let kept = "a".repeat(REDACT_MIN_RUN - 1);
        let dropped = "b".repeat(REDACT_MIN_RUN);
        let output = format!("{kept} {dropped}");
        assert_eq!(redact(&output), format!("{kept} {REDACTED}"));
    }

    #[test]
    fn redaction_counts_dash_and_underscore_as_token_characters() {
        let run = "abc-def_ghi".repeat(3);
        assert_eq!(run.len(), 33);
        assert_eq!(redact(&run), REDACTED);
        assert_eq!(redact("short-run_ok"), "short-run_ok");
    }

    #[test]
    fn redaction_leaves_text_without_long_runs_borrowed() {
        assert!(matches!(redact("nothing to hide"), Cow::Borrowed(_)));
    }

    #[test]
    fn append_adds_trailing_line() {
        assert_eq!(append_directive("", "ls"), "ls");
        assert_eq!(append_directive("notes", "ls"), "notes\nls");
        assert_eq!(append_directive("notes\n", "ls"), "notes\nls");
    }

    #[test]
    fn validate_rejects_multiline_and_empty() {
        assert!(validate_directive("a\nb").is_err());
        assert!(validate_directive("a\r").is_err());
        assert!(validate_directive("   ").is_err());
        assert_eq!(validate_directive("  ls ").expect("valid"), "ls");
    }
}
