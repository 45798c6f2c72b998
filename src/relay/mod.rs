use crate::error::AppResult;
use async_trait::async_trait;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;

pub mod detector;
pub mod inbound;
pub mod outbound;

pub const OBJECT_CHAT_COMPLETION: &str = "chat.completion";
pub const OBJECT_CHAT_COMPLETION_CHUNK: &str = "chat.completion.chunk";
pub const OBJECT_ERROR: &str = "error";

/// The wire dialects the gateway can speak on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiFormat {
    #[serde(rename = "openai_chat")]
    OpenAiChat,
    #[serde(rename = "openai_response")]
    OpenAiResponse,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAiChat => "openai_chat",
            ApiFormat::OpenAiResponse => "openai_response",
            ApiFormat::Anthropic => "anthropic",
            ApiFormat::Gemini => "gemini",
        }
    }

    /// Unrecognized names fall back to OpenAI Chat.
    pub fn parse(s: &str) -> Self {
        match s {
            "openai_response" => ApiFormat::OpenAiResponse,
            "anthropic" => ApiFormat::Anthropic,
            "gemini" => ApiFormat::Gemini,
            _ => ApiFormat::OpenAiChat,
        }
    }
}

impl Default for ApiFormat {
    fn default() -> Self {
        ApiFormat::OpenAiChat
    }
}

/// Unified request model shared by all adapters. The serialized form is
/// OpenAI Chat; dialects that cannot express a field simply omit it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayRequest {
    pub model: String,
    pub messages: Vec<Message>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Stop>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning_effort: String,
    #[serde(skip)]
    pub reasoning_budget: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    #[serde(skip)]
    pub raw_api_format: ApiFormat,
    #[serde(skip)]
    pub transformer_metadata: HashMap<String, String>,
}

impl RelayRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.is_empty() {
            return Err("model is required".to_string());
        }
        if self.messages.is_empty() {
            return Err("messages are required".to_string());
        }
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_usage: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip)]
    pub reasoning_signature: Option<String>,
    #[serde(skip)]
    pub cache_control: Option<CacheControl>,
}

impl Message {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(content.into())),
            ..Default::default()
        }
    }

    pub fn content_text(&self) -> String {
        self.content.as_ref().map(|c| c.text()).unwrap_or_default()
    }
}

/// Message content is either a bare string or an ordered list of parts.
/// The wire polymorphism lives entirely in the serde impls below.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    if let ContentPart::Text { text } = part {
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

impl Serialize for MessageContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessageContent::Text(s) => serializer.serialize_str(s),
            MessageContent::Parts(parts) => {
                if let [ContentPart::Text { text }] = parts.as_slice() {
                    return serializer.serialize_str(text);
                }
                parts.serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(MessageContent::Text(s)),
            Value::Array(items) => {
                let parts: Vec<ContentPart> = serde_json::from_value(Value::Array(items))
                    .map_err(DeError::custom)?;
                Ok(MessageContent::Parts(parts))
            }
            _ => Err(DeError::custom(
                "invalid content type: expected string or array of parts",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Stop sequences: one string on the wire when there is exactly one.
#[derive(Debug, Clone, PartialEq)]
pub enum Stop {
    One(String),
    Many(Vec<String>),
}

impl Stop {
    pub fn sequences(&self) -> Vec<String> {
        match self {
            Stop::One(s) => vec![s.clone()],
            Stop::Many(list) => list.clone(),
        }
    }
}

impl Serialize for Stop {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Stop::One(s) => serializer.serialize_str(s),
            Stop::Many(list) => list.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Stop {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Stop::One(s)),
            Value::Array(items) => {
                let list: Vec<String> =
                    serde_json::from_value(Value::Array(items)).map_err(DeError::custom)?;
                Ok(Stop::Many(list))
            }
            _ => Err(DeError::custom("invalid stop type: expected string or array")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: Function,
    #[serde(skip)]
    pub cache_control: Option<CacheControl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub function: FunctionCall,
    #[serde(default)]
    pub index: u32,
}

/// Tool choice: `auto`/`required`/`none` tokens stay strings, a named choice
/// is the `{type, function}` object form.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Mode(String),
    Named(NamedToolChoice),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedToolChoice {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
}

impl ToolChoice {
    pub fn named(name: impl Into<String>) -> Self {
        ToolChoice::Named(NamedToolChoice {
            kind: "function".to_string(),
            function: ToolFunction { name: name.into() },
        })
    }
}

impl Serialize for ToolChoice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ToolChoice::Mode(s) => serializer.serialize_str(s),
            ToolChoice::Named(named) => named.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ToolChoice {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(ToolChoice::Mode(s)),
            obj @ Value::Object(_) => {
                let named: NamedToolChoice =
                    serde_json::from_value(obj).map_err(DeError::custom)?;
                Ok(ToolChoice::Named(named))
            }
            _ => Err(DeError::custom("invalid tool choice type")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Provider-specific cache hint (Anthropic); never serialized in the
/// canonical form.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub kind: String,
    pub ttl: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub audio_tokens: i64,
    #[serde(default)]
    pub cached_tokens: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub audio_tokens: i64,
    #[serde(default)]
    pub reasoning_tokens: i64,
    #[serde(default)]
    pub accepted_prediction_tokens: i64,
    #[serde(default)]
    pub rejected_prediction_tokens: i64,
}

/// Unified response model; also the shape of one streaming chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_fingerprint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_tier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl RelayResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_response(status: u16, detail: ErrorDetail) -> Self {
        Self {
            object: OBJECT_ERROR.to_string(),
            created: chrono::Utc::now().timestamp(),
            error: Some(ResponseError { status, detail }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Canonical error. The HTTP status rides alongside the wire detail but is
/// never part of the serialized payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseError {
    pub status: u16,
    pub detail: ErrorDetail,
}

impl Serialize for ResponseError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.detail.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ResponseError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let detail = ErrorDetail::deserialize(deserializer)?;
        Ok(Self { status: 0, detail })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub param: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
}

/// Client-side adapter. Instances are stateful per request: the streaming
/// accumulator behind `internal_response` is why the factory must hand out a
/// fresh instance every time.
pub trait Inbound: Send {
    fn format(&self) -> ApiFormat;

    /// Parse a client-dialect body into the canonical request.
    fn transform_request(&mut self, body: &[u8]) -> AppResult<RelayRequest>;

    /// Serialize a complete canonical response into client bytes; the
    /// response is also stored for `internal_response`.
    fn transform_response(&mut self, response: &RelayResponse) -> AppResult<Vec<u8>>;

    /// Frame one canonical chunk as client stream bytes, folding it into the
    /// accumulator on the way through.
    fn transform_stream(&mut self, chunk: &RelayResponse) -> AppResult<Vec<u8>>;

    /// The stored response (non-stream) or the response assembled from all
    /// folded chunks (stream).
    fn internal_response(&self) -> RelayResponse;
}

/// Provider-side adapter. Stateless; safe to share across requests.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Build the upstream HTTP request: URL per dialect rules, credential
    /// attachment, body in the upstream dialect.
    fn transform_request(
        &self,
        client: &reqwest::Client,
        request: &RelayRequest,
        base_url: &str,
        key: &str,
    ) -> AppResult<reqwest::RequestBuilder>;

    /// Read the entire upstream response into canonical form; non-2xx bodies
    /// decode into the canonical error.
    async fn transform_response(&self, response: reqwest::Response) -> AppResult<RelayResponse>;

    /// Parse one framed upstream event. `None` means the event carries no
    /// client-visible payload.
    fn transform_stream(&self, event_data: &[u8]) -> AppResult<Option<RelayResponse>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_string_round_trip() {
        let content: MessageContent = serde_json::from_value(json!("hello")).unwrap();
        assert_eq!(content, MessageContent::Text("hello".to_string()));
        assert_eq!(serde_json::to_value(&content).unwrap(), json!("hello"));
    }

    #[test]
    fn content_single_text_part_serializes_as_string() {
        let content = MessageContent::Parts(vec![ContentPart::Text {
            text: "hi".to_string(),
        }]);
        assert_eq!(serde_json::to_value(&content).unwrap(), json!("hi"));
    }

    #[test]
    fn content_mixed_parts_round_trip() {
        let raw = json!([
            { "type": "text", "text": "look:" },
            { "type": "image_url", "image_url": { "url": "data:image/png;base64,AAA=" } }
        ]);
        let content: MessageContent = serde_json::from_value(raw.clone()).unwrap();
        match &content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            other => panic!("expected parts, got {other:?}"),
        }
        assert_eq!(serde_json::to_value(&content).unwrap(), raw);
    }

    #[test]
    fn content_rejects_numbers() {
        assert!(serde_json::from_value::<MessageContent>(json!(42)).is_err());
    }

    #[test]
    fn stop_single_and_multiple() {
        let one: Stop = serde_json::from_value(json!("END")).unwrap();
        assert_eq!(serde_json::to_value(&one).unwrap(), json!("END"));

        let many: Stop = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert_eq!(serde_json::to_value(&many).unwrap(), json!(["a", "b"]));
        assert_eq!(many.sequences(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn tool_choice_token_and_named() {
        let auto: ToolChoice = serde_json::from_value(json!("auto")).unwrap();
        assert_eq!(auto, ToolChoice::Mode("auto".to_string()));

        let named: ToolChoice = serde_json::from_value(
            json!({ "type": "function", "function": { "name": "lookup" } }),
        )
        .unwrap();
        assert_eq!(named, ToolChoice::named("lookup"));
        assert_eq!(
            serde_json::to_value(&named).unwrap(),
            json!({ "type": "function", "function": { "name": "lookup" } })
        );
    }

    #[test]
    fn request_validation() {
        let mut req = RelayRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::text("user", "hi")],
            ..Default::default()
        };
        assert!(req.validate().is_ok());

        req.messages.clear();
        assert!(req.validate().is_err());

        req.messages.push(Message::text("user", "hi"));
        req.model.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn response_error_detail_is_the_wire_form() {
        let resp = RelayResponse::error_response(
            429,
            ErrorDetail {
                message: "slow down".to_string(),
                kind: "rate_limit_exceeded".to_string(),
                ..Default::default()
            },
        );
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["error"]["message"], "slow down");
        assert_eq!(value["error"]["type"], "rate_limit_exceeded");
        assert!(value["error"].get("status").is_none());
    }

    #[test]
    fn internal_fields_never_serialize() {
        let mut req = RelayRequest {
            model: "m".to_string(),
            messages: vec![Message::text("user", "hi")],
            raw_api_format: ApiFormat::Anthropic,
            ..Default::default()
        };
        req.transformer_metadata
            .insert("scratch".to_string(), "x".to_string());
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("raw_api_format").is_none());
        assert!(value.get("transformer_metadata").is_none());
    }
}
