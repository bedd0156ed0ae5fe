use std::borrow::Cow;

/// Ellipsis appended when an excerpt is cut short
const ELLIPSIS: &str = "...";

/// Strips control characters that are not allowed in XML 1.0 documents.
///
/// Scraped markup occasionally carries stray control bytes (form feeds,
/// NULs, ANSI escapes pasted into CMS fields). Any of them in a rendered feed
/// makes the whole document unparseable, so they are removed before text
/// reaches storage.
///
/// Strips:
/// - ASCII control chars: 0x00-0x08, 0x0B-0x0C, 0x0E-0x1F, 0x7F
/// - ANSI CSI sequences: `\x1b[` ... (terminal byte 0x40-0x7E)
///
/// Preserves: tab (0x09), newline (0x0A), carriage return (0x0D).
///
/// Returns `Cow::Borrowed` when the input contains no control characters (common case).
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let is_control = |b: u8| b == 0x7f || (b < 0x20 && b != 0x09 && b != 0x0a && b != 0x0d);

    if !s.bytes().any(is_control) {
        return Cow::Borrowed(s);
    }

    let bytes = s.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len);
    let mut i = 0;

    while i < len {
        let b = bytes[i];

        if b == 0x1b && i + 1 < len && bytes[i + 1] == b'[' {
            // CSI sequence: skip parameter/intermediate bytes through the final byte
            i += 2;
            while i < len {
                let c = bytes[i];
                i += 1;
                if (0x40..=0x7e).contains(&c) {
                    break;
                }
            }
        } else if is_control(b) {
            i += 1;
        } else {
            let start = i;
            i += 1;
            while i < len && !is_control(bytes[i]) {
                i += 1;
            }
            // SAFETY: we only break on ASCII control bytes, which cannot appear
            // mid-codepoint in valid UTF-8, so s[start..i] is valid UTF-8.
            out.push_str(&s[start..i]);
        }
    }

    Cow::Owned(out)
}

/// Collapses every run of whitespace into a single space and trims both ends.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cleans scraped text for storage: control characters stripped, whitespace
/// normalized. Returns `None` when nothing printable is left.
pub fn clean_text(s: &str) -> Option<String> {
    let cleaned = normalize_whitespace(&strip_control_chars(s));
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Truncates a string to at most `max_chars` characters, appending "..." when
/// anything was cut. Never splits a UTF-8 code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        None => Cow::Borrowed(s),
        Some(_) => {
            let keep = max_chars.saturating_sub(ELLIPSIS.len());
            let end = s.char_indices().nth(keep).map(|(i, _)| i).unwrap_or(s.len());
            let mut out = s[..end].trim_end().to_string();
            out.push_str(ELLIPSIS);
            Cow::Owned(out)
        }
    }
}

/// Escapes the five HTML-significant characters so plain text can be embedded
/// in a field that feed readers interpret as HTML.
pub fn escape_html(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_control_chars_clean_input_borrowed() {
        let input = "Plain headline\twith tab";
        assert!(matches!(strip_control_chars(input), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_control_chars_removes_controls() {
        assert_eq!(strip_control_chars("a\x00b\x0cc\x7fd"), "abcd");
        assert_eq!(strip_control_chars("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_control_chars("line\nbreak\r\n"), "line\nbreak\r\n");
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  a \n\t b   c "), "a b c");
        assert_eq!(normalize_whitespace(""), "");
    }

    #[test]
    fn test_clean_text_empty_becomes_none() {
        assert_eq!(clean_text(" \n\x00\t "), None);
        assert_eq!(clean_text(" Kernel\n release "), Some("Kernel release".to_string()));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("exactly10!", 10), "exactly10!");
        assert_eq!(truncate_chars("Hello wonderful world", 10), "Hello w...");
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        let s = "日本語テキストです";
        let out = truncate_chars(s, 6);
        assert_eq!(out, "日本語...");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("no markup"), "no markup");
        assert_eq!(
            escape_html(r#"<b>"Tom" & 'Jerry'</b>"#),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
    }
}
