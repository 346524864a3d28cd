//! Filename sanitization.
//!
//! Turns arbitrary media titles into names that are safe on every
//! filesystem we serve from. The transform is idempotent: sanitizing an
//! already-sanitized name is a no-op.

/// Characters removed outright from filenames.
const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Byte ceiling for a sanitized filename (UTF-8).
const MAX_FILENAME_BYTES: usize = 200;

/// Sanitize a raw filename.
///
/// - removes `< > : " / \ | ? *`
/// - strips control characters
/// - collapses whitespace runs into a single `_`
/// - truncates to 200 bytes on a UTF-8 boundary
///
/// The result may be empty; callers treat an empty sanitized name as a
/// validation failure.
#[must_use]
pub fn sanitize_filename(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_FILENAME_BYTES));
    let mut pending_gap = false;

    for c in raw.chars() {
        if c.is_control() || FORBIDDEN.contains(&c) {
            continue;
        }
        if c.is_whitespace() {
            pending_gap = !out.is_empty();
            continue;
        }
        if pending_gap {
            out.push('_');
            pending_gap = false;
        }
        out.push(c);
    }

    truncate_utf8(&mut out, MAX_FILENAME_BYTES);
    out
}

/// Truncate a string to at most `max` bytes without splitting a char.
fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_forbidden_characters() {
        assert_eq!(sanitize_filename(r#"a<b>c:d"e/f\g|h?i*j"#), "abcdefghij");
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(sanitize_filename("My   Cool\tVideo"), "My_Cool_Video");
        assert_eq!(sanitize_filename("a \n b"), "a_b");
    }

    #[test]
    fn strips_control_characters() {
        assert_eq!(sanitize_filename("a\u{0}b\u{7}c\u{1b}[0m"), "abc[0m");
    }

    #[test]
    fn leading_and_trailing_whitespace_leaves_no_underscores() {
        assert_eq!(sanitize_filename("  hello  "), "hello");
    }

    #[test]
    fn truncates_on_utf8_boundary() {
        // 100 two-byte chars = 200 bytes, plus one more gets cut.
        let raw = "é".repeat(101);
        let safe = sanitize_filename(&raw);
        assert!(safe.len() <= 200);
        assert_eq!(safe, "é".repeat(100));
    }

    #[test]
    fn sanitize_is_idempotent() {
        for raw in [
            r#"We/ird: <name>?"#,
            "tabs\tand  spaces",
            "plain-name.mp4",
            "日本語 タイトル",
            &"x".repeat(500),
        ] {
            let once = sanitize_filename(raw);
            let twice = sanitize_filename(&once);
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn can_produce_empty_output() {
        assert_eq!(sanitize_filename("???"), "");
        assert_eq!(sanitize_filename("   "), "");
    }
}
