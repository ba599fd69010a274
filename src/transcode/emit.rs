//! Downstream frame encoding.
//!
//! Renders [`OutputChunk`]s as OpenAI `chat.completion.chunk` SSE frames.
//! Frames are built by direct string assembly on the hot path; the shapes
//! are fixed, so no serde round trip is needed.

use super::OutputChunk;
use crate::util::{push_json_string_escaped, push_u64_decimal, unix_now_secs};

/// Terminal SSE sentinel.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Per-session frame encoder. Holds the response identity shared by every
/// frame of one response and tracks whether a finish frame went out.
pub struct ChunkEncoder {
    response_id: String,
    model: String,
    created: u64,
    finish_sent: bool,
}

impl ChunkEncoder {
    #[must_use]
    pub fn new(response_id: String, model: String) -> Self {
        Self {
            response_id,
            model,
            created: unix_now_secs(),
            finish_sent: false,
        }
    }

    /// Render one chunk as a complete SSE frame (or frames, for the stream
    /// end, which may carry both the finish frame and the sentinel).
    #[must_use]
    pub fn encode(&mut self, chunk: &OutputChunk) -> String {
        let mut out = String::with_capacity(192);
        self.encode_into(chunk, &mut out);
        out
    }

    pub fn encode_into(&mut self, chunk: &OutputChunk, out: &mut String) {
        match chunk {
            OutputChunk::ContentDelta(text) => {
                self.frame(out, None, |delta| {
                    delta.push_str("{\"content\":");
                    push_json_string_escaped(delta, text);
                    delta.push('}');
                });
            }
            OutputChunk::ToolCallStart { id, name } => {
                self.frame(out, None, |delta| {
                    delta.push_str("{\"role\":\"assistant\",\"content\":null,\"tool_calls\":[{\"index\":0,\"id\":");
                    push_json_string_escaped(delta, id);
                    delta.push_str(",\"type\":\"function\",\"function\":{\"name\":");
                    push_json_string_escaped(delta, name);
                    delta.push_str(",\"arguments\":\"\"}}]}");
                });
            }
            OutputChunk::ToolCallArgsDelta { fragment, .. } => {
                self.frame(out, None, |delta| {
                    delta.push_str("{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":");
                    push_json_string_escaped(delta, fragment);
                    delta.push_str("}}]}");
                });
            }
            OutputChunk::ToolCallFinish { .. } => {
                self.frame(out, Some("tool_calls"), |delta| delta.push_str("{}"));
                self.finish_sent = true;
            }
            OutputChunk::StreamEnd => {
                if !self.finish_sent {
                    self.frame(out, Some("stop"), |delta| delta.push_str("{}"));
                    self.finish_sent = true;
                }
                out.push_str(DONE_FRAME);
            }
        }
    }

    fn frame(&self, out: &mut String, finish_reason: Option<&str>, delta: impl FnOnce(&mut String)) {
        out.push_str("data: {\"id\":");
        push_json_string_escaped(out, &self.response_id);
        out.push_str(",\"object\":\"chat.completion.chunk\",\"created\":");
        push_u64_decimal(out, self.created);
        out.push_str(",\"model\":");
        push_json_string_escaped(out, &self.model);
        out.push_str(",\"choices\":[{\"index\":0,\"delta\":");
        delta(out);
        out.push_str(",\"finish_reason\":");
        match finish_reason {
            Some(reason) => push_json_string_escaped(out, reason),
            None => out.push_str("null"),
        }
        out.push_str("}]}\n\n");
    }
}
