use crate::relay::inbound::InboundType;
use serde_json::Value;

/// Decide which client dialect a request speaks. Path rules win over body
/// probing; unknown inputs fall back to OpenAI Chat, never an error.
pub fn detect_format(path: &str, body: &[u8]) -> InboundType {
    if let Some(kind) = detect_by_path(path) {
        return kind;
    }
    if let Some(kind) = detect_by_body(body) {
        return kind;
    }
    InboundType::OpenAiChat
}

fn detect_by_path(path: &str) -> Option<InboundType> {
    let path = path.to_ascii_lowercase();
    if path.contains("/chat/completions") {
        return Some(InboundType::OpenAiChat);
    }
    if path.contains("/responses") {
        return Some(InboundType::OpenAiResponse);
    }
    if path.contains("/messages") {
        return Some(InboundType::Anthropic);
    }
    None
}

fn detect_by_body(body: &[u8]) -> Option<InboundType> {
    if body.is_empty() {
        return None;
    }
    let probe: Value = serde_json::from_slice(body).ok()?;
    let obj = probe.as_object()?;

    if is_anthropic_shape(obj) {
        return Some(InboundType::Anthropic);
    }
    if obj.contains_key("input") || obj.contains_key("modalities") {
        return Some(InboundType::OpenAiResponse);
    }
    None
}

/// Anthropic requests either carry a top-level `system` field or open with a
/// content-block array whose first block uses an Anthropic block type.
fn is_anthropic_shape(obj: &serde_json::Map<String, Value>) -> bool {
    if obj.contains_key("system") {
        return true;
    }

    let first_content = obj
        .get("messages")
        .and_then(|v| v.as_array())
        .and_then(|msgs| msgs.first())
        .and_then(|msg| msg.get("content"))
        .and_then(|v| v.as_array())
        .and_then(|blocks| blocks.first());
    let Some(block) = first_content else {
        return false;
    };

    matches!(
        block.get("type").and_then(|v| v.as_str()),
        Some("text" | "image" | "tool_use" | "tool_result")
    )
}
