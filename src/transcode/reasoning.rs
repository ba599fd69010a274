use std::borrow::Cow;

use memchr::memmem;

// Reasoning-span suppression.
//
// Models served through drawbridge may interleave `<think>…</think>` spans
// with visible output. Nothing inside a span may reach the client, and the
// tool-call detector must never match markup inside one.

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// True when the buffer ends inside an unterminated reasoning span, i.e. a
/// start marker occurs after the most recent end marker.
#[must_use]
pub fn is_inside_reasoning(buffer: &str) -> bool {
    let bytes = buffer.as_bytes();
    let last_open = memmem::rfind(bytes, THINK_OPEN.as_bytes());
    let last_close = memmem::rfind(bytes, THINK_CLOSE.as_bytes());
    match (last_open, last_close) {
        (Some(open), Some(close)) => open > close,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Remove every complete `<think>…</think>` span. When a start marker has no
/// matching end marker yet, the buffer is truncated at that start marker —
/// nothing after it counts as visible output.
#[must_use]
pub fn strip_reasoning(buffer: &str) -> Cow<'_, str> {
    let bytes = buffer.as_bytes();
    let Some(first_open) = memmem::find(bytes, THINK_OPEN.as_bytes()) else {
        return Cow::Borrowed(buffer);
    };

    let mut out = String::with_capacity(buffer.len());
    out.push_str(&buffer[..first_open]);
    let mut cursor = first_open;
    loop {
        let span_start = cursor + THINK_OPEN.len();
        let Some(close_rel) = memmem::find(&bytes[span_start..], THINK_CLOSE.as_bytes()) else {
            // Unterminated span — everything from the start marker is hidden.
            return Cow::Owned(out);
        };
        cursor = span_start + close_rel + THINK_CLOSE.len();
        let Some(next_rel) = memmem::find(&bytes[cursor..], THINK_OPEN.as_bytes()) else {
            out.push_str(&buffer[cursor..]);
            return Cow::Owned(out);
        };
        out.push_str(&buffer[cursor..cursor + next_rel]);
        cursor += next_rel;
    }
}

/// Length of the longest suffix of `buffer` that is a strict prefix of
/// `literal`. That suffix might still grow into the full literal, so it must
/// be withheld from output until more bytes arrive.
#[must_use]
pub fn ambiguous_suffix_len(buffer: &str, literal: &str) -> usize {
    let max = literal.len().saturating_sub(1).min(buffer.len());
    for keep in (1..=max).rev() {
        if buffer.ends_with(&literal[..keep]) {
            return keep;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inside_reasoning_tracks_last_markers() {
        assert!(!is_inside_reasoning("plain text"));
        assert!(is_inside_reasoning("a<think>deliberating"));
        assert!(!is_inside_reasoning("a<think>x</think>b"));
        assert!(is_inside_reasoning("a<think>x</think>b<think>y"));
    }

    #[test]
    fn strip_removes_complete_spans() {
        assert_eq!(strip_reasoning("pre<think>hidden</think>post"), "prepost");
        assert_eq!(
            strip_reasoning("<think>a</think>mid<think>b</think>end"),
            "midend"
        );
    }

    #[test]
    fn strip_truncates_at_open_span() {
        assert_eq!(strip_reasoning("visible<think>still going"), "visible");
        assert_eq!(strip_reasoning("<think>only hidden"), "");
    }

    #[test]
    fn strip_without_markers_borrows() {
        let input = "no markers here";
        assert!(matches!(strip_reasoning(input), Cow::Borrowed(_)));
    }

    #[test]
    fn ambiguous_suffix_finds_longest_prefix() {
        assert_eq!(ambiguous_suffix_len("hello <tool", "<tool_call>"), 5);
        assert_eq!(ambiguous_suffix_len("hello <", "<tool_call>"), 1);
        assert_eq!(ambiguous_suffix_len("hello", "<tool_call>"), 0);
        // A complete literal is not a *strict* prefix.
        assert_eq!(ambiguous_suffix_len("<tool_call>", "<tool_call>"), 0);
    }

    #[test]
    fn ambiguous_suffix_for_think_marker() {
        assert_eq!(ambiguous_suffix_len("text <th", "<think>"), 3);
        assert_eq!(ambiguous_suffix_len("text <thought", "<think>"), 0);
    }
}
