//! Streaming tool-call transcoder.
//!
//! Rewrites a live upstream token stream — prose, `<think>` reasoning spans,
//! and an emulated `<tool_call>…</tool_call>` grammar — into a sequence of
//! [`OutputChunk`]s that the emitter renders as OpenAI-compatible
//! `chat.completion.chunk` SSE frames.
//!
//! Emission decisions are made under partial information: a suffix of the
//! buffered text might be the start of a control tag, a reasoning marker, or
//! ordinary content, and the correct classification is only known once more
//! bytes arrive. The invariants:
//!
//! - no partial control tag or reasoning marker ever leaks as content;
//! - bytes emitted as tool-call arguments are never retracted or altered;
//! - at most one tool call exists per session;
//! - exactly one [`OutputChunk::StreamEnd`] closes every session.

pub mod emit;
pub mod extract;
pub mod reasoning;

use memchr::memmem;

use crate::sse::{FinishSignal, UpstreamEvent};
use crate::util::next_call_id;
use reasoning::{ambiguous_suffix_len, is_inside_reasoning, strip_reasoning, THINK_OPEN};

/// Opening control tag delimiting an emulated tool call.
pub const TOOL_CALL_OPEN: &str = "<tool_call>";
/// Closing control tag.
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// One downstream state transition. Each variant renders to exactly one SSE
/// `data:` line; `StreamEnd` additionally renders the terminal sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    ContentDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallArgsDelta { id: String, fragment: String },
    ToolCallFinish { id: String },
    StreamEnd,
}

/// Serialization convention the model picked inside the control tag.
/// Decided once per call, never reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Unknown,
    Json,
    Xml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Scanning,
    Reasoning,
    ToolCall,
    Closed,
}

// ---------------------------------------------------------------------------
// ToolCallState
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ToolCallState {
    id: String,
    dialect: Dialect,
    name: Option<String>,
    /// Everything received since the opening tag, dialect-agnostic.
    raw: String,
    /// Bytes of the arguments value already emitted downstream. Monotonic;
    /// emitted bytes are a prefix of the final arguments string.
    args_streamed: usize,
    /// Next unscanned byte of `raw` while streaming the arguments value.
    scan_pos: usize,
    brace_depth: i32,
    in_string: bool,
    escape_next: bool,
    /// `"arguments": {` located; `scan_pos` points into the value.
    args_started: bool,
    args_complete: bool,
    /// The value after `"arguments":` is not an object — never streamed
    /// incrementally, always resolved by full-buffer extraction.
    args_not_object: bool,
    start_emitted: bool,
}

impl ToolCallState {
    fn new(initial: String) -> Self {
        Self {
            id: next_call_id(),
            dialect: Dialect::Unknown,
            name: None,
            raw: initial,
            args_streamed: 0,
            scan_pos: 0,
            brace_depth: 0,
            in_string: false,
            escape_next: false,
            args_started: false,
            args_complete: false,
            args_not_object: false,
            start_emitted: false,
        }
    }

    /// Classification rule, evaluated on buffer growth until decided:
    /// XML field tags or a leading markup root mean `xml`, anything else
    /// (typically a `{`) means `json`.
    fn classify(&mut self) {
        if self.dialect != Dialect::Unknown {
            return;
        }
        let bytes = self.raw.as_bytes();
        if memmem::find(bytes, b"<name>").is_some()
            || memmem::find(bytes, b"<arguments>").is_some()
        {
            self.dialect = Dialect::Xml;
            return;
        }
        let Some(first) = self.raw.trim_start().chars().next() else {
            return;
        };
        self.dialect = if first == '<' {
            Dialect::Xml
        } else {
            Dialect::Json
        };
    }

    /// Process newly arrived bytes while the closing tag has not been seen.
    fn advance(&mut self, out: &mut Vec<OutputChunk>) {
        self.classify();
        if self.dialect != Dialect::Json {
            // XML dialect accumulates until the closing tag.
            return;
        }

        if self.name.is_none() {
            self.name = extract::find_name_field(&self.raw)
                .or_else(|| extract::guess_name(&self.raw).map(str::to_string));
        }
        if !self.start_emitted {
            if let Some(name) = &self.name {
                out.push(OutputChunk::ToolCallStart {
                    id: self.id.clone(),
                    name: name.clone(),
                });
                self.start_emitted = true;
            }
        }

        // Argument deltas may only follow the start chunk.
        if !self.start_emitted || self.args_complete || self.args_not_object {
            return;
        }
        if !self.args_started {
            self.try_locate_arguments();
        }
        if self.args_started && !self.args_complete {
            self.stream_args(self.raw.len(), true, out);
        }
    }

    /// Locate the `"arguments": {` pattern. Waits when the value has not
    /// started yet; marks non-object values as unstreamable.
    fn try_locate_arguments(&mut self) {
        let bytes = self.raw.as_bytes();
        let Some(key_at) = memmem::find(bytes, b"\"arguments\"") else {
            return;
        };
        let mut i = key_at + "\"arguments\"".len();
        while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
            i += 1;
        }
        if bytes.get(i) != Some(&b':') {
            if bytes.get(i).is_some() {
                self.args_not_object = true;
            }
            return;
        }
        i += 1;
        while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
            i += 1;
        }
        match bytes.get(i) {
            None => {} // value not started yet
            Some(&b'{') => {
                self.args_started = true;
                self.scan_pos = i;
                self.brace_depth = 0;
                self.in_string = false;
                self.escape_next = false;
            }
            Some(_) => self.args_not_object = true,
        }
    }

    /// Walk the unstreamed suffix of the arguments value and emit the safely
    /// classified prefix as one delta.
    ///
    /// With `withhold` set, scanning stops before any trailing region that
    /// could still be a prefix of the closing control tag; at closing-tag
    /// time the boundary is known exactly and withholding is skipped.
    fn stream_args(&mut self, hard_limit: usize, withhold: bool, out: &mut Vec<OutputChunk>) {
        let mut limit = hard_limit.min(self.raw.len());
        if withhold {
            limit -= ambiguous_suffix_len(&self.raw[..limit], TOOL_CALL_CLOSE);
        }
        if limit <= self.scan_pos {
            return;
        }

        let start = self.scan_pos;
        let bytes = self.raw.as_bytes();
        let mut i = start;
        let mut completed = false;
        while i < limit {
            let b = bytes[i];
            if self.in_string {
                if self.escape_next {
                    self.escape_next = false;
                } else if b == b'\\' {
                    self.escape_next = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' => self.brace_depth += 1,
                    b'}' => {
                        self.brace_depth -= 1;
                        if self.brace_depth == 0 {
                            completed = true;
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
            if completed {
                break;
            }
        }

        if i > start {
            let fragment = self.raw[start..i].to_string();
            self.args_streamed += fragment.len();
            self.scan_pos = i;
            out.push(OutputChunk::ToolCallArgsDelta {
                id: self.id.clone(),
                fragment,
            });
        }
        if completed {
            self.args_complete = true;
        }
    }

    /// Finish the call with `raw[..body_end]` as its body. Runs on
    /// closing-tag detection or, best-effort, at upstream end of stream.
    fn close(&mut self, body_end: usize, out: &mut Vec<OutputChunk>) {
        let streaming = self.dialect == Dialect::Json && self.args_started && self.start_emitted;
        if streaming {
            if !self.args_complete {
                // The value boundary is now exact; drain without withholding.
                self.stream_args(body_end, false, out);
                self.args_complete = true;
            }
            out.push(OutputChunk::ToolCallFinish {
                id: self.id.clone(),
            });
            return;
        }

        let resolved = extract::resolve(&self.raw[..body_end], self.name.as_deref());
        if !self.start_emitted {
            out.push(OutputChunk::ToolCallStart {
                id: self.id.clone(),
                name: resolved.name.clone(),
            });
            self.start_emitted = true;
        }
        if self.args_streamed == 0 {
            out.push(OutputChunk::ToolCallArgsDelta {
                id: self.id.clone(),
                fragment: resolved.arguments,
            });
        }
        out.push(OutputChunk::ToolCallFinish {
            id: self.id.clone(),
        });
    }
}

// ---------------------------------------------------------------------------
// TranscodeSession
// ---------------------------------------------------------------------------

/// All transcoding state for one request/response pair. Exclusively owned by
/// the request that created it; nothing survives the response.
pub struct TranscodeSession {
    mode: Mode,
    /// Unclassified visible text: withheld tag prefixes in `Scanning`, the
    /// open reasoning span (marker included) in `Reasoning`.
    pending: String,
    call: Option<ToolCallState>,
    tools_enabled: bool,
    ended: bool,
}

impl TranscodeSession {
    #[must_use]
    pub fn new(tools_enabled: bool) -> Self {
        Self {
            mode: Mode::Scanning,
            pending: String::new(),
            call: None,
            tools_enabled,
            ended: false,
        }
    }

    /// Feed one decoded upstream event, appending resulting chunks to `out`.
    pub fn push_event(&mut self, event: &UpstreamEvent, out: &mut Vec<OutputChunk>) {
        if !event.content.is_empty() {
            self.push_content(&event.content, out);
        }
        if event.finish == FinishSignal::Stop {
            self.finish(out);
        }
    }

    /// Feed a content delta.
    pub fn push_content(&mut self, text: &str, out: &mut Vec<OutputChunk>) {
        if text.is_empty() || self.ended {
            return;
        }
        if !self.tools_enabled {
            // Passthrough: no detection logic engaged.
            out.push(OutputChunk::ContentDelta(text.to_string()));
            return;
        }
        match self.mode {
            Mode::Closed => {}
            Mode::ToolCall => {
                if let Some(call) = self.call.as_mut() {
                    call.raw.push_str(text);
                }
                self.advance_tool_call(out);
            }
            Mode::Scanning | Mode::Reasoning => {
                self.pending.push_str(text);
                self.process_pending(out);
            }
        }
    }

    /// Close the session at upstream end of stream. Flushes withheld text,
    /// force-finishes an open tool call, and emits the single `StreamEnd`.
    pub fn finish(&mut self, out: &mut Vec<OutputChunk>) {
        if self.ended {
            return;
        }
        self.ended = true;
        if self.tools_enabled {
            match self.mode {
                Mode::Scanning => {
                    // No more bytes can arrive; withholding no longer applies.
                    if !self.pending.is_empty() {
                        out.push(OutputChunk::ContentDelta(std::mem::take(&mut self.pending)));
                    }
                }
                Mode::Reasoning => {
                    // An unterminated reasoning span stays hidden.
                    self.pending.clear();
                }
                Mode::ToolCall => {
                    if let Some(call) = self.call.as_mut() {
                        let body_end = call.raw.len();
                        call.close(body_end, out);
                    }
                    self.mode = Mode::Closed;
                }
                Mode::Closed => {}
            }
        }
        out.push(OutputChunk::StreamEnd);
    }

    /// True once the session has emitted its terminal sentinel.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn process_pending(&mut self, out: &mut Vec<OutputChunk>) {
        loop {
            match self.mode {
                Mode::Scanning => {
                    let bytes = self.pending.as_bytes();
                    let think_at = memmem::find(bytes, THINK_OPEN.as_bytes());
                    let tool_at = memmem::find(bytes, TOOL_CALL_OPEN.as_bytes());
                    match (think_at, tool_at) {
                        (Some(t), tool) if tool.map_or(true, |c| t < c) => {
                            self.emit_prefix(t, out);
                            // Keep the marker buffered; the span is dropped
                            // wholesale once its end marker arrives.
                            self.mode = Mode::Reasoning;
                        }
                        (_, Some(c)) => {
                            self.emit_prefix(c, out);
                            let body = self
                                .pending
                                .split_off(TOOL_CALL_OPEN.len());
                            self.pending.clear();
                            self.call = Some(ToolCallState::new(body));
                            self.mode = Mode::ToolCall;
                            self.advance_tool_call(out);
                            return;
                        }
                        _ => {
                            let withheld = ambiguous_suffix_len(&self.pending, TOOL_CALL_OPEN)
                                .max(ambiguous_suffix_len(&self.pending, THINK_OPEN));
                            let safe = self.pending.len() - withheld;
                            self.emit_prefix(safe, out);
                            return;
                        }
                    }
                }
                Mode::Reasoning => {
                    if is_inside_reasoning(&self.pending) {
                        return;
                    }
                    // Span closed: drop it and rescan whatever follows.
                    self.pending = strip_reasoning(&self.pending).into_owned();
                    self.mode = Mode::Scanning;
                }
                Mode::ToolCall | Mode::Closed => return,
            }
        }
    }

    /// Emit `pending[..len]` as a content delta and drop it from the buffer.
    fn emit_prefix(&mut self, len: usize, out: &mut Vec<OutputChunk>) {
        if len == 0 {
            return;
        }
        let rest = self.pending.split_off(len);
        let text = std::mem::replace(&mut self.pending, rest);
        out.push(OutputChunk::ContentDelta(text));
    }

    fn advance_tool_call(&mut self, out: &mut Vec<OutputChunk>) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if let Some(pos) = memmem::find(call.raw.as_bytes(), TOOL_CALL_CLOSE.as_bytes()) {
            call.close(pos, out);
            self.mode = Mode::Closed;
            return;
        }
        call.advance(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_chunks(session: &mut TranscodeSession, chunks: &[&str]) -> Vec<OutputChunk> {
        let mut out = Vec::new();
        for chunk in chunks {
            session.push_content(chunk, &mut out);
        }
        session.finish(&mut out);
        out
    }

    fn content_concat(chunks: &[OutputChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| match c {
                OutputChunk::ContentDelta(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn args_concat(chunks: &[OutputChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| match c {
                OutputChunk::ToolCallArgsDelta { fragment, .. } => Some(fragment.as_str()),
                _ => None,
            })
            .collect()
    }

    fn started_name(chunks: &[OutputChunk]) -> Option<&str> {
        chunks.iter().find_map(|c| match c {
            OutputChunk::ToolCallStart { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    #[test]
    fn plain_content_is_forwarded_exactly() {
        let mut session = TranscodeSession::new(true);
        let out = feed_chunks(&mut session, &["Hello, ", "wor", "ld. No tags here."]);
        assert_eq!(content_concat(&out), "Hello, world. No tags here.");
        assert_eq!(out.last(), Some(&OutputChunk::StreamEnd));
    }

    #[test]
    fn partial_tag_prefix_never_leaks() {
        let mut session = TranscodeSession::new(true);
        let mut out = Vec::new();
        session.push_content("before <tool", &mut out);
        for chunk in &out {
            if let OutputChunk::ContentDelta(text) = chunk {
                assert!(!text.contains('<'), "withheld prefix leaked: {text:?}");
            }
        }
        session.push_content("box> after", &mut out);
        session.finish(&mut out);
        // "<toolbox>" is not the control tag; it must surface as content.
        assert_eq!(content_concat(&out), "before <toolbox> after");
    }

    #[test]
    fn split_control_tag_starts_a_tool_call() {
        let input = "Sure, here: <tool_call>\n{\"name\":\"display_diagram\",\"arguments\":{\"xml\":\"<mxCell/>\"}}\n</tool_call>";
        // Try a handful of split positions to exercise boundary handling.
        for split in [1, 5, 12, 13, 20, 26, input.len() - 3] {
            let mut session = TranscodeSession::new(true);
            let (a, b) = input.split_at(split);
            let out = feed_chunks(&mut session, &[a, b]);
            assert_eq!(content_concat(&out), "Sure, here: ", "split at {split}");
            assert_eq!(started_name(&out), Some("display_diagram"));
            assert_eq!(args_concat(&out), "{\"xml\":\"<mxCell/>\"}");
            assert!(out
                .iter()
                .any(|c| matches!(c, OutputChunk::ToolCallFinish { .. })));
        }
    }

    #[test]
    fn args_stream_concatenation_matches_full_extraction() {
        let body = "{\"name\":\"edit_diagram\",\"arguments\":{\"operations\":[{\"operation\":\"update\",\"cell_id\":\"2\",\"style\":\"fillColor=#ffe6cc;\"}]}}";
        let input = format!("<tool_call>\n{body}\n</tool_call>");
        // Byte-at-a-time delivery is the worst case for the streamer.
        let mut session = TranscodeSession::new(true);
        let mut out = Vec::new();
        for i in 0..input.len() {
            if input.is_char_boundary(i) {
                let end = (i + 1..=input.len())
                    .find(|&j| input.is_char_boundary(j))
                    .unwrap();
                session.push_content(&input[i..end], &mut out);
            }
        }
        session.finish(&mut out);
        assert_eq!(
            args_concat(&out),
            "{\"operations\":[{\"operation\":\"update\",\"cell_id\":\"2\",\"style\":\"fillColor=#ffe6cc;\"}]}"
        );
        assert_eq!(started_name(&out), Some("edit_diagram"));
    }

    #[test]
    fn name_guessed_from_content_shape_before_name_field() {
        let mut session = TranscodeSession::new(true);
        let mut out = Vec::new();
        session.push_content("<tool_call>{\"arguments\": {\"operations\": [", &mut out);
        assert_eq!(started_name(&out), Some("edit_diagram"));
        session.push_content("]}, \"name\": \"edit_diagram\"}</tool_call>", &mut out);
        session.finish(&mut out);
        assert_eq!(args_concat(&out), "{\"operations\": []}");
    }

    #[test]
    fn braces_inside_json_strings_do_not_close_arguments() {
        let input = "<tool_call>{\"name\":\"display_diagram\",\"arguments\":{\"xml\":\"a{b}c}\"}}</tool_call>";
        let mut session = TranscodeSession::new(true);
        let out = feed_chunks(&mut session, &[input]);
        assert_eq!(args_concat(&out), "{\"xml\":\"a{b}c}\"}");
    }

    #[test]
    fn xml_dialect_defers_to_full_extraction() {
        let input = "<tool_call>\n<name>edit_diagram</name>\n<arguments>\n{\"operations\":[{\"operation\":\"update\",\"cell_id\":\"2\"}]}\n</arguments>\n</tool_call>";
        let mut session = TranscodeSession::new(true);
        let (a, b) = input.split_at(30);
        let out = feed_chunks(&mut session, &[a, b]);
        assert_eq!(started_name(&out), Some("edit_diagram"));
        let deltas: Vec<_> = out
            .iter()
            .filter(|c| matches!(c, OutputChunk::ToolCallArgsDelta { .. }))
            .collect();
        assert_eq!(deltas.len(), 1, "xml dialect streams a single delta");
        assert_eq!(
            args_concat(&out),
            "{\"operations\":[{\"operation\":\"update\",\"cell_id\":\"2\"}]}"
        );
    }

    #[test]
    fn raw_xml_body_wrapped_for_display_tool() {
        let input = "<tool_call><mxGraphModel><root/></mxGraphModel></tool_call>";
        let mut session = TranscodeSession::new(true);
        let out = feed_chunks(&mut session, &[input]);
        assert_eq!(started_name(&out), Some("display_diagram"));
        let args: serde_json::Value = serde_json::from_str(&args_concat(&out)).unwrap();
        assert_eq!(args["xml"], "<mxGraphModel><root/></mxGraphModel>");
    }

    #[test]
    fn reasoning_span_is_invisible_and_untriggering() {
        let mut session = TranscodeSession::new(true);
        let out = feed_chunks(
            &mut session,
            &[
                "<think>maybe call <tool_call> here?</think>",
                "The answer is 42.",
            ],
        );
        assert_eq!(content_concat(&out), "The answer is 42.");
        assert!(started_name(&out).is_none());
        for chunk in &out {
            if let OutputChunk::ContentDelta(text) = chunk {
                assert!(!text.contains("maybe call"));
            }
        }
    }

    #[test]
    fn reasoning_marker_split_across_chunks() {
        let mut session = TranscodeSession::new(true);
        let out = feed_chunks(
            &mut session,
            &["A<thi", "nk>hidden</th", "ink>B"],
        );
        assert_eq!(content_concat(&out), "AB");
    }

    #[test]
    fn unterminated_reasoning_span_is_dropped_at_finish() {
        let mut session = TranscodeSession::new(true);
        let out = feed_chunks(&mut session, &["visible <think>never closed"]);
        assert_eq!(content_concat(&out), "visible ");
        assert_eq!(out.last(), Some(&OutputChunk::StreamEnd));
    }

    #[test]
    fn truncated_tool_call_still_finishes() {
        let mut session = TranscodeSession::new(true);
        let out = feed_chunks(
            &mut session,
            &["<tool_call>{\"name\":\"display_diagram\",\"arguments\":{\"xml\":\"<mxCell"],
        );
        assert!(out
            .iter()
            .any(|c| matches!(c, OutputChunk::ToolCallFinish { .. })));
        assert_eq!(out.last(), Some(&OutputChunk::StreamEnd));
    }

    #[test]
    fn exactly_one_stream_end_per_session() {
        let mut session = TranscodeSession::new(true);
        let mut out = Vec::new();
        session.push_content("text", &mut out);
        session.finish(&mut out);
        session.finish(&mut out);
        session.push_content("late", &mut out);
        let ends = out
            .iter()
            .filter(|c| matches!(c, OutputChunk::StreamEnd))
            .count();
        assert_eq!(ends, 1);
        assert!(session.is_ended());
    }

    #[test]
    fn passthrough_mode_forwards_everything_verbatim() {
        let mut session = TranscodeSession::new(false);
        let out = feed_chunks(
            &mut session,
            &["<think>kept</think>", "<tool_call>also kept</tool_call>"],
        );
        assert_eq!(
            content_concat(&out),
            "<think>kept</think><tool_call>also kept</tool_call>"
        );
        assert!(started_name(&out).is_none());
    }

    #[test]
    fn trailing_content_after_tool_call_is_ignored() {
        let input = "<tool_call>{\"name\":\"display_diagram\",\"arguments\":{\"xml\":\"x\"}}</tool_call> trailing prose";
        let mut session = TranscodeSession::new(true);
        let out = feed_chunks(&mut session, &[input]);
        assert_eq!(content_concat(&out), "");
        assert!(out
            .iter()
            .any(|c| matches!(c, OutputChunk::ToolCallFinish { .. })));
    }

    #[test]
    fn non_object_arguments_fall_back_to_extraction() {
        let input = "<tool_call>{\"name\":\"display_diagram\",\"arguments\":\"<mxCell/>\"}</tool_call>";
        let mut session = TranscodeSession::new(true);
        let out = feed_chunks(&mut session, &[input]);
        let deltas: Vec<_> = out
            .iter()
            .filter(|c| matches!(c, OutputChunk::ToolCallArgsDelta { .. }))
            .collect();
        assert_eq!(deltas.len(), 1);
        assert_eq!(args_concat(&out), "<mxCell/>");
    }
}
