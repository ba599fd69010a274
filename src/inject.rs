//! Upstream request preparation for tool emulation.
//!
//! The upstream model has no native function calling, so the tool contract
//! is taught in-band: tool schemas and the `<tool_call>` grammar go into the
//! system prompt, and any native tool history from the client is flattened
//! back into the same textual convention before forwarding.

use crate::api::types::{ChatCompletionRequest, ChatMessage, ToolDef};
use crate::util::push_json_string_escaped;

/// Render the system-prompt section describing the available tools and the
/// expected call markup.
#[must_use]
pub fn render_tool_prompt(tools: &[ToolDef]) -> String {
    let mut prompt = String::with_capacity(512 + tools.len() * 256);
    prompt.push_str(
        "You have access to the following tools. Use them when they help answer the request.\n\n<tools>\n",
    );
    for tool in tools {
        if let Ok(schema) = serde_json::to_string(&tool.function) {
            prompt.push_str(&schema);
            prompt.push('\n');
        }
    }
    prompt.push_str("</tools>\n\n");
    prompt.push_str(
        "To call a tool, respond with exactly one block in this format and nothing after it:\n\
         <tool_call>\n\
         {\"name\": \"<tool name>\", \"arguments\": {<arguments as JSON>}}\n\
         </tool_call>\n\
         Tool results arrive in <tool_response> blocks in later user messages.",
    );
    prompt
}

/// Build the message list forwarded upstream: tool prompt injected into the
/// system message, native tool history flattened to the textual convention.
#[must_use]
pub fn prepare_upstream_messages(request: &ChatCompletionRequest) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(request.messages.len() + 1);

    if request.wants_tools() {
        let prompt = render_tool_prompt(request.tools.as_deref().unwrap_or_default());
        match request.messages.first() {
            Some(first) if first.role == "system" => {
                let mut merged = first.content_text().unwrap_or_default().to_string();
                if !merged.is_empty() {
                    merged.push_str("\n\n");
                }
                merged.push_str(&prompt);
                out.push(ChatMessage::text("system", merged));
            }
            _ => out.push(ChatMessage::text("system", prompt)),
        }
    }

    let skip_first_system = request.wants_tools()
        && request
            .messages
            .first()
            .is_some_and(|message| message.role == "system");

    for (index, message) in request.messages.iter().enumerate() {
        if index == 0 && skip_first_system {
            continue;
        }
        match message.role.as_str() {
            "assistant" if message.tool_calls.is_some() => out.push(flatten_assistant(message)),
            "tool" => out.push(flatten_tool(message)),
            _ => out.push(message.clone()),
        }
    }
    out
}

fn flatten_assistant(message: &ChatMessage) -> ChatMessage {
    let mut text = message.content_text().unwrap_or_default().to_string();
    for call in message.tool_calls.as_deref().unwrap_or_default() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str("<tool_call>\n{\"name\": ");
        push_json_string_escaped(&mut text, &call.function.name);
        text.push_str(", \"arguments\": ");
        // Arguments are already a JSON document; embed as-is.
        text.push_str(&call.function.arguments);
        text.push_str("}\n</tool_call>");
    }
    ChatMessage::text("assistant", text)
}

fn flatten_tool(message: &ChatMessage) -> ChatMessage {
    let body = match &message.content {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let mut text = String::with_capacity(body.len() + 64);
    text.push_str("<tool_response>\n");
    if let Some(id) = &message.tool_call_id {
        text.push_str("{\"tool_call_id\": ");
        push_json_string_escaped(&mut text, id);
        text.push_str(", \"content\": ");
        push_json_string_escaped(&mut text, &body);
        text.push('}');
    } else {
        text.push_str(&body);
    }
    text.push_str("\n</tool_response>");
    ChatMessage::text("user", text)
}
