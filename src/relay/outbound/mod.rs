use crate::relay::{ApiFormat, Outbound};
use std::sync::Arc;

pub mod anthropic;
pub mod gemini;
pub mod openai_chat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundType {
    OpenAiChat,
    OpenAiResponse,
    Anthropic,
    Gemini,
}

impl OutboundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundType::OpenAiChat => "openai_chat",
            OutboundType::OpenAiResponse => "openai_response",
            OutboundType::Anthropic => "anthropic",
            OutboundType::Gemini => "gemini",
        }
    }

    /// Resolve a group's configured `api_format` string; unrecognized values
    /// fall back to OpenAI Chat.
    pub fn from_api_format(format: ApiFormat) -> Self {
        match format {
            ApiFormat::OpenAiChat => OutboundType::OpenAiChat,
            ApiFormat::OpenAiResponse => OutboundType::OpenAiResponse,
            ApiFormat::Anthropic => OutboundType::Anthropic,
            ApiFormat::Gemini => OutboundType::Gemini,
        }
    }
}

/// Outbound adapters are stateless, so one shared instance per dialect is
/// enough. `None` means the dialect has no registered implementation.
pub fn get_outbound(kind: OutboundType) -> Option<Arc<dyn Outbound>> {
    match kind {
        OutboundType::OpenAiChat => Some(Arc::new(openai_chat::ChatOutbound)),
        OutboundType::Anthropic => Some(Arc::new(anthropic::MessagesOutbound)),
        OutboundType::Gemini => Some(Arc::new(gemini::GenerateContentOutbound)),
        OutboundType::OpenAiResponse => None,
    }
}

/// Split one framed SSE event into (event-type, data payload). The event
/// type comes from an explicit `event:` line when present, else from the
/// `type` field inside the data JSON.
pub(crate) fn parse_sse_event(event_data: &[u8]) -> (String, Vec<u8>) {
    let mut event_type = String::new();
    let mut data = Vec::new();

    for line in event_data.split(|b| *b == b'\n') {
        let line = trim_bytes(line);
        if let Some(rest) = line.strip_prefix(b"event:".as_slice()) {
            event_type = String::from_utf8_lossy(trim_bytes(rest)).to_string();
        } else if let Some(rest) = line.strip_prefix(b"data:".as_slice()) {
            data = trim_bytes(rest).to_vec();
        }
    }

    if event_type.is_empty() && !data.is_empty() {
        if let Ok(probe) = serde_json::from_slice::<serde_json::Value>(&data) {
            if let Some(kind) = probe.get("type").and_then(|v| v.as_str()) {
                event_type = kind.to_string();
            }
        }
    }

    if data.is_empty() {
        data = trim_bytes(event_data).to_vec();
    }

    (event_type, data)
}

fn trim_bytes(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Parse a `data:<media-type>;base64,<data>` URL into (media-type, base64
/// payload). Anything else is an error: cross-dialect image translation
/// requires the bytes inline.
pub(crate) fn parse_data_url(url: &str) -> Result<(String, String), String> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| "only data URLs are supported for image conversion".to_string())?;
    let (metadata, data) = rest
        .split_once(',')
        .ok_or_else(|| "invalid data URL format".to_string())?;

    let mut media_type = "application/octet-stream".to_string();
    let mut is_base64 = false;
    for (i, part) in metadata.split(';').enumerate() {
        if i == 0 && !part.is_empty() {
            media_type = part.to_string();
        } else if part == "base64" {
            is_base64 = true;
        }
    }

    if !is_base64 {
        return Err("only base64 encoded data URLs are supported".to_string());
    }
    Ok((media_type, data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_api_format_covers_all_formats() {
        assert_eq!(
            OutboundType::from_api_format(ApiFormat::parse("anthropic")),
            OutboundType::Anthropic
        );
        assert_eq!(
            OutboundType::from_api_format(ApiFormat::parse("gemini")),
            OutboundType::Gemini
        );
        assert_eq!(
            OutboundType::from_api_format(ApiFormat::parse("something_else")),
            OutboundType::OpenAiChat
        );
    }

    #[test]
    fn sse_event_with_explicit_type() {
        let (kind, data) = parse_sse_event(b"event: message_delta\ndata: {\"a\":1}");
        assert_eq!(kind, "message_delta");
        assert_eq!(data, b"{\"a\":1}");
    }

    #[test]
    fn sse_event_type_from_data_json() {
        let (kind, data) = parse_sse_event(b"data: {\"type\":\"ping\"}");
        assert_eq!(kind, "ping");
        assert_eq!(data, b"{\"type\":\"ping\"}");
    }

    #[test]
    fn bare_payload_is_the_data() {
        let (kind, data) = parse_sse_event(b"{\"candidates\":[]}");
        assert_eq!(kind, "");
        assert_eq!(data, b"{\"candidates\":[]}");
    }

    #[test]
    fn data_url_parsing() {
        assert_eq!(
            parse_data_url("data:image/png;base64,AAA=").unwrap(),
            ("image/png".to_string(), "AAA=".to_string())
        );
        assert!(parse_data_url("https://example.com/cat.png").is_err());
        assert!(parse_data_url("data:image/png,plain").is_err());
        assert!(parse_data_url("data:image/png;base64").is_err());
    }
}
