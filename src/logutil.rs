//! Logging and text-budget helpers.
//!
//! Mesh traffic is user supplied: names and message bodies may contain newlines or
//! control characters that would otherwise split one log record across lines.
//! [`escape_log`] keeps every record on a single line. [`truncate_utf8`] cuts a string
//! to a byte budget without slicing through a multi-byte character, which matters for
//! replies that carry emoji.

use std::fmt::Write;

/// Longest preview of user text written to the log.
const MAX_PREVIEW: usize = 200;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters => `\xNN`
///
/// Input longer than the preview limit is cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Return the longest prefix of `input` that fits in `max_bytes` and ends on a
/// character boundary.
pub fn truncate_utf8(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }
    let mut cut = max_bytes;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    &input[..cut]
}

/// Lowercase hex rendering of a byte slice (public-key prefixes, path hops).
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
