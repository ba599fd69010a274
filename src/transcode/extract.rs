//! Closing-tag-time extraction of a buffered tool-call body.
//!
//! Runs once per call, when the closing control tag (or end of stream) is
//! confirmed. Layered resolution, first match wins:
//!
//! 1. XML tag-pair form — `<name>X</name>` plus `<arguments>Y</arguments>`,
//!    tolerating an unterminated `<arguments>`.
//! 2. JSON object form — `name`/`arguments` keys, or well-known argument
//!    shapes that identify the tool on their own.
//! 3. Raw XML content form — markup wrapped as a `display_diagram` payload.
//! 4. Last resort — body forwarded verbatim for the best-known name.

use memchr::memmem;

use super::reasoning::strip_reasoning;

/// Tool assumed when a diagram payload carries no usable name.
pub const DISPLAY_TOOL: &str = "display_diagram";
/// Tool assumed when the body is a bare `operations` batch.
pub const EDIT_TOOL: &str = "edit_diagram";

/// Ordered `(field literal, tool name)` heuristics for guessing the tool
/// before (or without) an explicit `"name"` field. First match wins.
pub const NAME_HINTS: &[(&str, &str)] = &[
    ("\"operations\"", EDIT_TOOL),
    ("\"cell_id\"", EDIT_TOOL),
    ("\"xml\"", DISPLAY_TOOL),
    ("<mxCell", DISPLAY_TOOL),
];

const NAME_OPEN: &str = "<name>";
const NAME_CLOSE: &str = "</name>";
const ARGS_OPEN: &str = "<arguments>";
const ARGS_CLOSE: &str = "</arguments>";

/// A fully resolved tool call: a name plus the arguments payload exactly as
/// it will be forwarded (already JSON text, never re-encoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCall {
    pub name: String,
    pub arguments: String,
}

/// Guess the tool name from the shape of a (possibly partial) body.
#[must_use]
pub fn guess_name(buffer: &str) -> Option<&'static str> {
    let bytes = buffer.as_bytes();
    NAME_HINTS
        .iter()
        .find(|(pattern, _)| memmem::find(bytes, pattern.as_bytes()).is_some())
        .map(|(_, name)| *name)
}

/// Extract a complete `"name": "<value>"` field from a (possibly partial)
/// JSON body. Requires the closing quote to have arrived.
#[must_use]
pub fn find_name_field(buffer: &str) -> Option<String> {
    let bytes = buffer.as_bytes();
    let key_at = memmem::find(bytes, b"\"name\"")?;
    let mut i = key_at + "\"name\"".len();
    while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
        i += 1;
    }
    if bytes.get(i) != Some(&b':') {
        return None;
    }
    i += 1;
    while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
        i += 1;
    }
    if bytes.get(i) != Some(&b'"') {
        return None;
    }
    let value_start = i + 1;
    let mut j = value_start;
    while let Some(&b) = bytes.get(j) {
        match b {
            b'\\' => j += 2,
            b'"' => {
                let raw = buffer.get(value_start..j)?;
                return serde_json::from_str::<String>(&format!("\"{raw}\"")).ok();
            }
            _ => j += 1,
        }
    }
    None
}

/// Resolve a complete tool-call body into a name and arguments payload.
///
/// `known_name` is whatever the streaming classifier already inferred; it
/// wins over the default but not over an explicit name in the body.
#[must_use]
pub fn resolve(body: &str, known_name: Option<&str>) -> ExtractedCall {
    let cleaned = strip_reasoning(body);
    let body = cleaned.trim();
    let fallback_name = known_name.unwrap_or(DISPLAY_TOOL);

    if let Some(call) = try_xml_tag_pair(body) {
        return call;
    }
    if let Some(call) = try_json_object(body, known_name) {
        return call;
    }
    if let Some(call) = try_raw_xml(body) {
        return call;
    }

    ExtractedCall {
        name: guess_name(body).unwrap_or(fallback_name).to_string(),
        arguments: body.to_string(),
    }
}

fn try_xml_tag_pair(body: &str) -> Option<ExtractedCall> {
    let bytes = body.as_bytes();
    let name_at = memmem::find(bytes, NAME_OPEN.as_bytes())?;
    let name_start = name_at + NAME_OPEN.len();
    let name_end = name_start + memmem::find(&bytes[name_start..], NAME_CLOSE.as_bytes())?;
    let name = body[name_start..name_end].trim();
    if name.is_empty() {
        return None;
    }

    let arguments = match memmem::find(bytes, ARGS_OPEN.as_bytes()) {
        Some(args_at) => {
            let args_start = args_at + ARGS_OPEN.len();
            // Tolerate an unterminated <arguments>: take everything to the end.
            let args_end = memmem::find(&bytes[args_start..], ARGS_CLOSE.as_bytes())
                .map_or(body.len(), |rel| args_start + rel);
            body[args_start..args_end].trim().to_string()
        }
        None => String::from("{}"),
    };

    Some(ExtractedCall {
        name: name.to_string(),
        arguments,
    })
}

fn try_json_object(body: &str, known_name: Option<&str>) -> Option<ExtractedCall> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;

    if let Some(name) = object.get("name").and_then(serde_json::Value::as_str) {
        let arguments = match object.get("arguments") {
            Some(serde_json::Value::String(raw)) => raw.clone(),
            Some(args @ serde_json::Value::Object(_)) => raw_object_arguments(body)
                .map_or_else(
                    || serde_json::to_string(args).unwrap_or_else(|_| String::from("{}")),
                    str::to_string,
                ),
            Some(args) => serde_json::to_string(args).unwrap_or_else(|_| String::from("{}")),
            None => String::from("{}"),
        };
        return Some(ExtractedCall {
            name: name.to_string(),
            arguments,
        });
    }

    let name = if object.contains_key("operations") {
        EDIT_TOOL
    } else if object.contains_key("xml") {
        DISPLAY_TOOL
    } else {
        known_name.unwrap_or(DISPLAY_TOOL)
    };
    Some(ExtractedCall {
        name: name.to_string(),
        arguments: body.to_string(),
    })
}

/// Raw source slice of the `"arguments"` object value inside `body`. Used so
/// extraction yields the same bytes the incremental streamer would have,
/// whitespace included.
fn raw_object_arguments(body: &str) -> Option<&str> {
    let bytes = body.as_bytes();
    let key_at = memmem::find(bytes, b"\"arguments\"")?;
    let mut i = key_at + "\"arguments\"".len();
    while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
        i += 1;
    }
    if bytes.get(i) != Some(&b':') {
        return None;
    }
    i += 1;
    while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
        i += 1;
    }
    if bytes.get(i) != Some(&b'{') {
        return None;
    }
    let start = i;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    while let Some(&b) = bytes.get(i) {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&body[start..=i]);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn try_raw_xml(body: &str) -> Option<ExtractedCall> {
    if !body.starts_with('<') {
        return None;
    }
    // Unwrap one optional <xml>…</xml> wrapper around the markup.
    let inner = body
        .strip_prefix("<xml>")
        .map(|rest| rest.strip_suffix("</xml>").unwrap_or(rest).trim())
        .unwrap_or(body);

    let mut arguments = String::with_capacity(inner.len() + 10);
    arguments.push_str("{\"xml\":");
    crate::util::push_json_string_escaped(&mut arguments, inner);
    arguments.push('}');
    Some(ExtractedCall {
        name: DISPLAY_TOOL.to_string(),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_tag_pair_form() {
        let body = "\n<name>edit_diagram</name>\n<arguments>\n{\"operations\":[]}\n</arguments>\n";
        let call = resolve(body, None);
        assert_eq!(call.name, "edit_diagram");
        assert_eq!(call.arguments, "{\"operations\":[]}");
    }

    #[test]
    fn xml_tag_pair_tolerates_unterminated_arguments() {
        let body = "<name>display_diagram</name><arguments>{\"xml\":\"<mxCell/>\"}";
        let call = resolve(body, None);
        assert_eq!(call.name, "display_diagram");
        assert_eq!(call.arguments, "{\"xml\":\"<mxCell/>\"}");
    }

    #[test]
    fn xml_tag_pair_without_arguments_yields_empty_object() {
        let call = resolve("<name>display_diagram</name>", None);
        assert_eq!(call.arguments, "{}");
    }

    #[test]
    fn json_object_with_name_and_arguments() {
        let body = "{\"name\":\"display_diagram\",\"arguments\":{\"xml\":\"<mxCell/>\"}}";
        let call = resolve(body, None);
        assert_eq!(call.name, "display_diagram");
        assert_eq!(call.arguments, "{\"xml\":\"<mxCell/>\"}");
    }

    #[test]
    fn json_object_arguments_preserve_source_whitespace() {
        let body = "{\"name\": \"edit_diagram\", \"arguments\": {\"operations\": [ ]}}";
        let call = resolve(body, None);
        assert_eq!(call.arguments, "{\"operations\": [ ]}");
    }

    #[test]
    fn json_object_with_string_arguments_kept_verbatim() {
        let body = "{\"name\":\"edit_diagram\",\"arguments\":\"{\\\"operations\\\":[]}\"}";
        let call = resolve(body, None);
        assert_eq!(call.arguments, "{\"operations\":[]}");
    }

    #[test]
    fn bare_operations_object_maps_to_edit_tool() {
        let body = "{\"operations\":[{\"operation\":\"update\",\"cell_id\":\"2\"}]}";
        let call = resolve(body, None);
        assert_eq!(call.name, EDIT_TOOL);
        assert_eq!(call.arguments, body);
    }

    #[test]
    fn bare_xml_key_object_maps_to_display_tool() {
        let body = "{\"xml\":\"<mxCell/>\"}";
        let call = resolve(body, None);
        assert_eq!(call.name, DISPLAY_TOOL);
        assert_eq!(call.arguments, body);
    }

    #[test]
    fn plain_json_object_uses_known_name() {
        let body = "{\"foo\":1}";
        let call = resolve(body, Some("custom_tool"));
        assert_eq!(call.name, "custom_tool");
        assert_eq!(call.arguments, body);
    }

    #[test]
    fn raw_xml_is_wrapped_as_display_arguments() {
        let call = resolve("<mxGraphModel><root/></mxGraphModel>", None);
        assert_eq!(call.name, DISPLAY_TOOL);
        let value: serde_json::Value = serde_json::from_str(&call.arguments).unwrap();
        assert_eq!(value["xml"], "<mxGraphModel><root/></mxGraphModel>");
    }

    #[test]
    fn raw_xml_unwraps_outer_wrapper() {
        let call = resolve("<xml><mxCell/></xml>", None);
        let value: serde_json::Value = serde_json::from_str(&call.arguments).unwrap();
        assert_eq!(value["xml"], "<mxCell/>");
    }

    #[test]
    fn last_resort_forwards_verbatim() {
        let call = resolve("not json, not xml", Some("edit_diagram"));
        assert_eq!(call.name, "edit_diagram");
        assert_eq!(call.arguments, "not json, not xml");
    }

    #[test]
    fn reasoning_spans_are_stripped_before_extraction() {
        let body = "<think>scratch</think>{\"xml\":\"<mxCell/>\"}";
        let call = resolve(body, None);
        assert_eq!(call.name, DISPLAY_TOOL);
        assert_eq!(call.arguments, "{\"xml\":\"<mxCell/>\"}");
    }

    #[test]
    fn guess_name_rules_are_ordered() {
        assert_eq!(guess_name("{\"operations\":["), Some(EDIT_TOOL));
        assert_eq!(guess_name("{\"xml\":\"<mx"), Some(DISPLAY_TOOL));
        assert_eq!(guess_name("plain"), None);
    }

    #[test]
    fn find_name_field_requires_complete_value() {
        assert_eq!(
            find_name_field("{\"name\": \"display_diagram\", \"ar").as_deref(),
            Some("display_diagram")
        );
        assert!(find_name_field("{\"name\": \"display_di").is_none());
        assert!(find_name_field("{\"arguments\": {}}").is_none());
    }

    #[test]
    fn find_name_field_decodes_escapes() {
        assert_eq!(
            find_name_field("{\"name\":\"a\\\"b\"}").as_deref(),
            Some("a\"b")
        );
    }
}
