//! SSE line reassembly and upstream event decoding.
//!
//! The upstream completion API speaks OpenAI-style SSE: `data: {json}` lines
//! separated by blank lines, terminated by `data: [DONE]`. Bytes arrive in
//! arbitrary chunk sizes, so a carry-over buffer reassembles lines that were
//! split across chunk boundaries (including inside a UTF-8 sequence).

use futures_util::Stream;
use memchr::memchr;
use serde::Deserialize;

/// Whether the upstream signalled completion on this event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishSignal {
    #[default]
    None,
    Stop,
}

/// One decoded upstream SSE line, normalized to a content delta plus an
/// optional completion signal.
#[derive(Debug, Clone, Default)]
pub struct UpstreamEvent {
    pub content: String,
    pub finish: FinishSignal,
}

impl UpstreamEvent {
    #[must_use]
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            finish: FinishSignal::None,
        }
    }

    #[must_use]
    pub fn stop() -> Self {
        Self {
            content: String::new(),
            finish: FinishSignal::Stop,
        }
    }
}

// ---------------------------------------------------------------------------
// Line reassembly
// ---------------------------------------------------------------------------

/// Splits an arbitrary byte-chunk stream into well-formed lines.
///
/// Partial trailing lines are carried across calls; `\r\n` endings are
/// normalized. Invalid UTF-8 can only occur when a multi-byte sequence is
/// split exactly at a chunk boundary, which line buffering already absorbs
/// (lines are only surfaced once their terminating `\n` arrived).
#[derive(Default)]
pub struct LineDecoder {
    carry: Vec<u8>,
}

impl LineDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a byte chunk and append every completed line to `lines`.
    pub fn feed(&mut self, chunk: &[u8], lines: &mut Vec<String>) {
        self.carry.extend_from_slice(chunk);
        let mut start = 0usize;
        while let Some(rel) = memchr(b'\n', &self.carry[start..]) {
            let end = start + rel;
            let mut line = &self.carry[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        if start > 0 {
            self.carry.drain(..start);
        }
    }

    /// Flush the trailing partial line at end of stream, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let mut line: &[u8] = &self.carry;
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let text = String::from_utf8_lossy(line).into_owned();
        self.carry.clear();
        Some(text)
    }
}

// ---------------------------------------------------------------------------
// Event decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
}

#[derive(Deserialize)]
struct UpstreamChoice {
    #[serde(default)]
    delta: UpstreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct UpstreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decode one SSE line into an [`UpstreamEvent`].
///
/// Blank lines, comments, non-`data:` fields, and lines whose JSON payload
/// does not parse are all dropped (`None`) — garbled upstream framing must
/// not abort the session.
#[must_use]
pub fn decode_data_line(line: &str) -> Option<UpstreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let payload = trimmed.strip_prefix("data:")?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim_end();
    if payload == "[DONE]" {
        return Some(UpstreamEvent::stop());
    }

    let chunk: UpstreamChunk = serde_json::from_str(payload).ok()?;
    let choice = chunk.choices.into_iter().next()?;
    let finish = match choice.finish_reason.as_deref() {
        Some("stop") | Some("length") => FinishSignal::Stop,
        _ => FinishSignal::None,
    };
    Some(UpstreamEvent {
        content: choice.delta.content.unwrap_or_default(),
        finish,
    })
}

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

/// Turn an HTTP response byte stream into a stream of [`UpstreamEvent`]s.
///
/// Transport errors mid-body terminate the stream; the caller's finalize
/// path is responsible for closing the downstream session cleanly.
pub fn upstream_event_stream<S, E>(byte_stream: S) -> impl Stream<Item = UpstreamEvent> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Debug + Send + 'static,
{
    use futures_util::StreamExt;

    futures_util::stream::unfold(
        (
            Box::pin(byte_stream),
            LineDecoder::new(),
            Vec::<String>::with_capacity(8),
            std::collections::VecDeque::<UpstreamEvent>::new(),
            false,
        ),
        |(mut stream, mut decoder, mut lines, mut pending, mut done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((event, (stream, decoder, lines, pending, done)));
                }
                if done {
                    return None;
                }
                match stream.as_mut().next().await {
                    Some(Ok(bytes)) => {
                        decoder.feed(&bytes, &mut lines);
                        for line in lines.drain(..) {
                            if let Some(event) = decode_data_line(&line) {
                                pending.push_back(event);
                            }
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!("upstream body error: {err:?}");
                        done = true;
                    }
                    None => {
                        if let Some(line) = decoder.finish() {
                            if let Some(event) = decode_data_line(&line) {
                                pending.push_back(event);
                            }
                        }
                        done = true;
                    }
                }
            }
        },
    )
}
