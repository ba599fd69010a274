//! `/v1/chat/completions` handler.
//!
//! Streamed requests with tools go through the transcoding pipeline; without
//! tools the upstream SSE bytes are proxied untouched. Non-streamed requests
//! drain the same pipeline and assemble a single `chat.completion` body.

use std::pin::Pin;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::{header, HeaderValue, StatusCode};
use serde_json::{json, Value};
use smallvec::SmallVec;

use crate::api::types::ChatCompletionRequest;
use crate::error::ProxyError;
use crate::inject::prepare_upstream_messages;
use crate::sse::{upstream_event_stream, UpstreamEvent};
use crate::state::AppState;
use crate::transcode::emit::ChunkEncoder;
use crate::transcode::{OutputChunk, TranscodeSession};
use crate::util::{next_response_id, unix_now_secs};

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ProxyError> {
    if request.messages.is_empty() {
        return Err(ProxyError::BadRequest(String::from(
            "messages must not be empty",
        )));
    }

    let tools_active = state.config.features.tool_emulation && request.wants_tools();
    let model = state
        .config
        .upstream
        .model
        .clone()
        .or_else(|| request.model.clone())
        .unwrap_or_else(|| String::from("default"));

    tracing::debug!(
        model,
        stream = request.stream,
        tools_active,
        "forwarding chat completion"
    );

    let body = build_upstream_body(&request, &model, tools_active);
    let upstream = send_upstream(&state, &body).await?;

    if request.stream {
        if tools_active {
            Ok(transcoded_stream_response(upstream, model))
        } else {
            Ok(passthrough_stream_response(upstream))
        }
    } else {
        aggregate_response(upstream, model, tools_active).await
    }
}

/// Upstream request body: prepared messages, forced streaming, client
/// sampling parameters forwarded, tool fields never included.
fn build_upstream_body(request: &ChatCompletionRequest, model: &str, tools_active: bool) -> Value {
    let messages = if tools_active {
        prepare_upstream_messages(request)
    } else {
        request.messages.clone()
    };

    let mut body = serde_json::Map::new();
    body.insert(String::from("model"), json!(model));
    body.insert(
        String::from("messages"),
        serde_json::to_value(&messages).unwrap_or_else(|_| Value::Array(Vec::new())),
    );
    body.insert(String::from("stream"), Value::Bool(true));
    for (key, value) in &request.extra {
        body.insert(key.clone(), value.clone());
    }
    Value::Object(body)
}

async fn send_upstream(state: &AppState, body: &Value) -> Result<reqwest::Response, ProxyError> {
    let mut request = state
        .http
        .post(state.config.upstream.chat_completions_url())
        .json(body);
    if let Some(key) = &state.config.upstream.api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::UpstreamStatus {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

struct StreamCtx {
    events: Pin<Box<dyn Stream<Item = UpstreamEvent> + Send>>,
    session: TranscodeSession,
    encoder: ChunkEncoder,
    pending: SmallVec<[Bytes; 4]>,
}

/// Pull upstream events through the session, render the resulting chunks,
/// and surface them as SSE frames. The session guarantees termination: once
/// it has emitted `StreamEnd` the stream closes, even after a mid-body
/// upstream failure (the event stream just ends and `finish` runs).
fn transcoded_stream_response(upstream: reqwest::Response, model: String) -> Response {
    let ctx = StreamCtx {
        events: Box::pin(upstream_event_stream(upstream.bytes_stream())),
        session: TranscodeSession::new(true),
        encoder: ChunkEncoder::new(next_response_id(), model),
        pending: SmallVec::new(),
    };

    let frames = futures_util::stream::unfold(ctx, |mut ctx| async move {
        loop {
            if !ctx.pending.is_empty() {
                let frame = ctx.pending.remove(0);
                return Some((Ok::<Bytes, std::convert::Infallible>(frame), ctx));
            }
            if ctx.session.is_ended() {
                return None;
            }

            let mut chunks = Vec::new();
            match ctx.events.next().await {
                Some(event) => ctx.session.push_event(&event, &mut chunks),
                None => ctx.session.finish(&mut chunks),
            }
            for chunk in &chunks {
                let frame = ctx.encoder.encode(chunk);
                if !frame.is_empty() {
                    ctx.pending.push(Bytes::from(frame));
                }
            }
        }
    });

    sse_response(Body::from_stream(frames))
}

/// No tools declared: the upstream already speaks the downstream protocol,
/// so its bytes are forwarded verbatim.
fn passthrough_stream_response(upstream: reqwest::Response) -> Response {
    sse_response(Body::from_stream(upstream.bytes_stream()))
}

fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    crate::api::apply_cors(headers);
    response
}

/// Non-streaming client: drain the pipeline and assemble one completion.
async fn aggregate_response(
    upstream: reqwest::Response,
    model: String,
    tools_active: bool,
) -> Result<Response, ProxyError> {
    let mut events = Box::pin(upstream_event_stream(upstream.bytes_stream()));
    let mut session = TranscodeSession::new(tools_active);
    let mut chunks = Vec::new();
    while let Some(event) = events.next().await {
        session.push_event(&event, &mut chunks);
        if session.is_ended() {
            break;
        }
    }
    session.finish(&mut chunks);

    let mut content = String::new();
    let mut call: Option<(String, String, String)> = None;
    for chunk in &chunks {
        match chunk {
            OutputChunk::ContentDelta(text) => content.push_str(text),
            OutputChunk::ToolCallStart { id, name } => {
                call = Some((id.clone(), name.clone(), String::new()));
            }
            OutputChunk::ToolCallArgsDelta { fragment, .. } => {
                if let Some((_, _, arguments)) = call.as_mut() {
                    arguments.push_str(fragment);
                }
            }
            OutputChunk::ToolCallFinish { .. } | OutputChunk::StreamEnd => {}
        }
    }

    let (message, finish_reason) = match call {
        Some((id, name, arguments)) => (
            json!({
                "role": "assistant",
                "content": if content.is_empty() { Value::Null } else { Value::String(content.clone()) },
                "tool_calls": [{
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments },
                }],
            }),
            "tool_calls",
        ),
        None => (json!({ "role": "assistant", "content": content }), "stop"),
    };

    let body = json!({
        "id": next_response_id(),
        "object": "chat.completion",
        "created": unix_now_secs(),
        "model": model,
        "choices": [{ "index": 0, "message": message, "finish_reason": finish_reason }],
    });
    let mut response = (StatusCode::OK, Json(body)).into_response();
    crate::api::apply_cors(response.headers_mut());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: &str) -> ChatCompletionRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn upstream_body_forces_stream_and_keeps_sampling_params() {
        let req = request(
            r#"{"model":"client-model","messages":[{"role":"user","content":"hi"}],"stream":false,"temperature":0.3}"#,
        );
        let body = build_upstream_body(&req, "served-model", false);
        assert_eq!(body["model"], "served-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn upstream_body_never_carries_tool_fields() {
        let req = request(
            r#"{"messages":[{"role":"user","content":"draw"}],"tools":[{"type":"function","function":{"name":"display_diagram"}}],"tool_choice":"auto"}"#,
        );
        let body = build_upstream_body(&req, "m", true);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
        // The contract moves into the injected system prompt instead.
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("display_diagram"));
    }
}
