use crate::error::{AppError, AppResult};
use crate::relay::outbound::parse_data_url;
use crate::relay::{
    Choice, ContentPart, ErrorDetail, FunctionCall, Message, MessageContent, Outbound,
    RelayRequest, RelayResponse, ToolCall, ToolChoice, Usage, OBJECT_CHAT_COMPLETION,
    OBJECT_CHAT_COMPLETION_CHUNK,
};
use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

/// Gemini GenerateContent provider-side adapter. Credentials travel as a
/// `key` query parameter rather than a header.
pub struct GenerateContentOutbound;

#[async_trait]
impl Outbound for GenerateContentOutbound {
    fn transform_request(
        &self,
        client: &reqwest::Client,
        request: &RelayRequest,
        base_url: &str,
        key: &str,
    ) -> AppResult<reqwest::RequestBuilder> {
        let url = build_url(base_url, &request.model, key, request.is_streaming());
        let body = build_body(request)
            .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err))?;
        Ok(client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .json(&body))
    }

    async fn transform_response(&self, response: reqwest::Response) -> AppResult<RelayResponse> {
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|err| {
            AppError::new(
                StatusCode::BAD_GATEWAY,
                "upstream_read_failed",
                err.to_string(),
            )
        })?;
        parse_response(status, &body)
    }

    fn transform_stream(&self, event_data: &[u8]) -> AppResult<Option<RelayResponse>> {
        let text = std::str::from_utf8(event_data).unwrap_or_default().trim();
        let text = text.strip_prefix("data:").map(str::trim).unwrap_or(text);

        // Gemini streams either bare JSON objects or a JSON array split
        // across lines; strip the array plumbing before parsing.
        let mut trimmed = text;
        if trimmed.starts_with('[') || trimmed.starts_with(',') {
            trimmed = trimmed.trim_start_matches(['[', ',']).trim_start();
        }
        if trimmed.ends_with(']') {
            trimmed = trimmed.trim_end_matches(']').trim_end();
        }
        if trimmed.is_empty() {
            return Ok(None);
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };

        if !value.is_object() {
            return Ok(None);
        }
        if value.get("candidates").is_none() {
            if let Some(error) = value.get("error") {
                let status = error.get("code").and_then(|v| v.as_u64()).unwrap_or(500) as u16;
                return Ok(Some(RelayResponse::error_response(
                    status,
                    ErrorDetail {
                        message: error
                            .get("message")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        kind: map_error_status(
                            error.get("status").and_then(|v| v.as_str()).unwrap_or(""),
                        )
                        .to_string(),
                        ..Default::default()
                    },
                )));
            }
        }

        Ok(Some(convert_chunk(&value)))
    }
}

/// URL construction. `<action>` is `generateContent`, or
/// `streamGenerateContent` when streaming.
pub(crate) fn build_url(base_url: &str, model: &str, key: &str, streaming: bool) -> String {
    let base = base_url.trim_end_matches('/');
    let action = if streaming {
        "streamGenerateContent"
    } else {
        "generateContent"
    };

    if base.contains("/models/") {
        if base.contains(":generateContent") || base.contains(":streamGenerateContent") {
            return format!("{base}?key={key}");
        }
        return format!("{base}:{action}?key={key}");
    }

    if base.ends_with("/v1beta") || base.ends_with("/v1") {
        return format!("{base}/models/{model}:{action}?key={key}");
    }

    format!("{base}/v1beta/models/{model}:{action}?key={key}")
}

pub(crate) fn build_body(request: &RelayRequest) -> Result<Value, String> {
    let mut contents = Vec::new();
    let mut system_instruction: Option<Value> = None;

    for message in &request.messages {
        if message.role == "system" {
            let text = message.content_text();
            if !text.is_empty() {
                system_instruction = Some(json!({ "parts": [{ "text": text }] }));
            }
            continue;
        }
        contents.push(convert_message(message)?);
    }

    let mut body = json!({ "contents": contents });
    let obj = body.as_object_mut().expect("generate content object");

    if let Some(system_instruction) = system_instruction {
        obj.insert("systemInstruction".to_string(), system_instruction);
    }
    if let Some(config) = generation_config(request) {
        obj.insert("generationConfig".to_string(), config);
    }
    if let Some(tools) = &request.tools {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "parameters": tool.function.parameters
                })
            })
            .collect();
        obj.insert(
            "tools".to_string(),
            json!([{ "functionDeclarations": declarations }]),
        );
    }
    if let Some(choice) = &request.tool_choice {
        obj.insert("toolConfig".to_string(), convert_tool_choice(choice));
    }

    Ok(body)
}

fn convert_message(message: &Message) -> Result<Value, String> {
    let role = match message.role.as_str() {
        "assistant" => "model",
        _ => "user",
    };

    // Tool results become functionResponse parts keyed by the call id.
    if let Some(tool_call_id) = &message.tool_call_id {
        return Ok(json!({
            "role": role,
            "parts": [{
                "functionResponse": {
                    "name": tool_call_id,
                    "response": { "result": message.content_text() }
                }
            }]
        }));
    }

    if message.role == "assistant" && !message.tool_calls.is_empty() {
        let mut parts = Vec::new();
        let text = message.content_text();
        if !text.is_empty() {
            parts.push(json!({ "text": text }));
        }
        for call in &message.tool_calls {
            let args = serde_json::from_str::<Value>(&call.function.arguments)
                .unwrap_or_else(|_| json!({}));
            parts.push(json!({
                "functionCall": { "name": call.function.name, "args": args }
            }));
        }
        return Ok(json!({ "role": role, "parts": parts }));
    }

    let parts = match &message.content {
        Some(MessageContent::Text(text)) => vec![json!({ "text": text })],
        Some(MessageContent::Parts(content_parts)) => {
            let mut parts = Vec::with_capacity(content_parts.len());
            for part in content_parts {
                parts.push(convert_part(part)?);
            }
            parts
        }
        None => vec![json!({ "text": "" })],
    };

    Ok(json!({ "role": role, "parts": parts }))
}

fn convert_part(part: &ContentPart) -> Result<Value, String> {
    match part {
        ContentPart::Text { text } => Ok(json!({ "text": text })),
        ContentPart::ImageUrl { image_url } => {
            let (mime_type, data) = parse_data_url(&image_url.url)
                .map_err(|err| format!("failed to parse image URL: {err}"))?;
            Ok(json!({ "inlineData": { "mimeType": mime_type, "data": data } }))
        }
    }
}

fn generation_config(request: &RelayRequest) -> Option<Value> {
    let mut config = serde_json::Map::new();
    if let Some(temperature) = request.temperature {
        config.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.top_p {
        config.insert("topP".to_string(), Value::from(top_p));
    }
    if let Some(max) = request.max_tokens.or(request.max_completion_tokens) {
        config.insert("maxOutputTokens".to_string(), Value::from(max));
    }
    if let Some(stop) = &request.stop {
        config.insert("stopSequences".to_string(), Value::from(stop.sequences()));
    }
    if config.is_empty() {
        None
    } else {
        Some(Value::Object(config))
    }
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    let mut config = serde_json::Map::new();
    match choice {
        ToolChoice::Mode(mode) => {
            let mode = match mode.as_str() {
                "required" => "ANY",
                "none" => "NONE",
                _ => "AUTO",
            };
            config.insert("mode".to_string(), Value::String(mode.to_string()));
        }
        ToolChoice::Named(named) => {
            config.insert("mode".to_string(), Value::String("ANY".to_string()));
            config.insert(
                "allowedFunctionNames".to_string(),
                json!([named.function.name]),
            );
        }
    }
    json!({ "functionCallingConfig": config })
}

pub(crate) fn parse_response(status: u16, body: &[u8]) -> AppResult<RelayResponse> {
    if status >= 400 {
        return Ok(parse_error_response(status, body));
    }

    let value: Value = serde_json::from_slice(body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_GATEWAY,
            "invalid_upstream_response",
            format!("failed to parse generate content response: {err}"),
        )
    })?;

    let mut response = RelayResponse {
        id: format!("gemini-{}", uuid::Uuid::new_v4()),
        object: OBJECT_CHAT_COMPLETION.to_string(),
        created: chrono::Utc::now().timestamp(),
        ..Default::default()
    };

    for (i, candidate) in value
        .get("candidates")
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
        .iter()
        .enumerate()
    {
        let mut choice = Choice {
            index: i as u32,
            ..Default::default()
        };
        if let Some(content) = candidate.get("content") {
            choice.message = Some(content_to_message(content));
        }
        if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
            choice.finish_reason = Some(finish_reason(reason).to_string());
        }
        response.choices.push(choice);
    }

    response.usage = parse_usage(&value);
    Ok(response)
}

fn content_to_message(content: &Value) -> Message {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for (i, part) in content
        .get("parts")
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
        .iter()
        .enumerate()
    {
        if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let args = call
                .get("args")
                .map(|args| args.to_string())
                .unwrap_or_default();
            tool_calls.push(ToolCall {
                id: format!("call_{i}"),
                kind: "function".to_string(),
                index: tool_calls.len() as u32,
                function: FunctionCall {
                    name,
                    arguments: args,
                },
            });
        }
    }

    Message {
        role: "assistant".to_string(),
        content: Some(MessageContent::Text(text)),
        tool_calls,
        ..Default::default()
    }
}

fn convert_chunk(value: &Value) -> RelayResponse {
    let mut chunk = RelayResponse {
        id: format!("gemini-{}", uuid::Uuid::new_v4()),
        object: OBJECT_CHAT_COMPLETION_CHUNK.to_string(),
        created: chrono::Utc::now().timestamp(),
        ..Default::default()
    };

    for (i, candidate) in value
        .get("candidates")
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
        .iter()
        .enumerate()
    {
        let mut delta = Message::default();
        if let Some(content) = candidate.get("content") {
            let message = content_to_message(content);
            let text = message.content_text();
            if !text.is_empty() {
                delta.content = Some(MessageContent::Text(text));
            }
            delta.tool_calls = message.tool_calls;
        }

        let mut choice = Choice {
            index: i as u32,
            delta: Some(delta),
            ..Default::default()
        };
        if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
            choice.finish_reason = Some(finish_reason(reason).to_string());
        }
        chunk.choices.push(choice);
    }

    chunk.usage = parse_usage(value);
    chunk
}

fn parse_usage(value: &Value) -> Option<Usage> {
    let usage = value.get("usageMetadata")?.as_object()?;
    Some(Usage {
        prompt_tokens: usage
            .get("promptTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        completion_tokens: usage
            .get("candidatesTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        total_tokens: usage
            .get("totalTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        ..Default::default()
    })
}

fn parse_error_response(status: u16, body: &[u8]) -> RelayResponse {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let detail = match parsed.as_ref().and_then(|v| v.get("error")) {
        Some(error) => {
            let google_status = error.get("status").and_then(|v| v.as_str()).unwrap_or("");
            ErrorDetail {
                message: error
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                kind: map_error_status(google_status).to_string(),
                code: google_status.to_string(),
                ..Default::default()
            }
        }
        None => ErrorDetail {
            message: String::from_utf8_lossy(body).to_string(),
            kind: "api_error".to_string(),
            ..Default::default()
        },
    };
    RelayResponse::error_response(status, detail)
}

pub(crate) fn map_error_status(status: &str) -> &'static str {
    match status {
        "INVALID_ARGUMENT" | "NOT_FOUND" => "invalid_request_error",
        "PERMISSION_DENIED" | "UNAUTHENTICATED" => "invalid_api_key",
        "RESOURCE_EXHAUSTED" => "rate_limit_exceeded",
        "INTERNAL" | "UNAVAILABLE" => "server_error",
        _ => "api_error",
    }
}

fn finish_reason(gemini_reason: &str) -> &'static str {
    match gemini_reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => "content_filter",
        _ => "stop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{ImageUrl, Tool, Function};

    #[test]
    fn url_construction_rules() {
        assert_eq!(
            build_url("https://host/v1beta/models/gemini-pro:generateContent", "x", "k", false),
            "https://host/v1beta/models/gemini-pro:generateContent?key=k"
        );
        assert_eq!(
            build_url("https://host/v1beta/models/gemini-pro", "x", "k", true),
            "https://host/v1beta/models/gemini-pro:streamGenerateContent?key=k"
        );
        assert_eq!(
            build_url("https://host/v1beta", "gemini-pro", "k", false),
            "https://host/v1beta/models/gemini-pro:generateContent?key=k"
        );
        assert_eq!(
            build_url("https://host/v1", "gemini-pro", "k", false),
            "https://host/v1/models/gemini-pro:generateContent?key=k"
        );
        assert_eq!(
            build_url("https://host", "gemini-pro", "k", true),
            "https://host/v1beta/models/gemini-pro:streamGenerateContent?key=k"
        );
    }

    #[test]
    fn roles_and_system_instruction() {
        let request = RelayRequest {
            model: "gemini-pro".to_string(),
            messages: vec![
                Message::text("system", "Be brief."),
                Message::text("user", "Hi"),
                Message::text("assistant", "Hello"),
            ],
            ..Default::default()
        };
        let body = build_body(&request).unwrap();
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn image_part_becomes_inline_data() {
        let request = RelayRequest {
            model: "gemini-pro".to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "data:image/jpeg;base64,QUJD".to_string(),
                        detail: None,
                    },
                }])),
                ..Default::default()
            }],
            ..Default::default()
        };
        let body = build_body(&request).unwrap();
        assert_eq!(
            body["contents"][0]["parts"][0]["inlineData"],
            json!({ "mimeType": "image/jpeg", "data": "QUJD" })
        );
    }

    #[test]
    fn tools_wrap_in_single_declarations_entry() {
        let request = RelayRequest {
            model: "gemini-pro".to_string(),
            messages: vec![Message::text("user", "Hi")],
            tools: Some(vec![
                Tool {
                    kind: "function".to_string(),
                    function: Function {
                        name: "a".to_string(),
                        parameters: json!({}),
                        ..Default::default()
                    },
                    cache_control: None,
                },
                Tool {
                    kind: "function".to_string(),
                    function: Function {
                        name: "b".to_string(),
                        parameters: json!({}),
                        ..Default::default()
                    },
                    cache_control: None,
                },
            ]),
            tool_choice: Some(ToolChoice::named("a")),
            ..Default::default()
        };
        let body = build_body(&request).unwrap();
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["functionDeclarations"].as_array().unwrap().len(), 2);
        assert_eq!(
            body["toolConfig"]["functionCallingConfig"],
            json!({ "mode": "ANY", "allowedFunctionNames": ["a"] })
        );
    }

    #[test]
    fn tool_choice_modes() {
        assert_eq!(
            convert_tool_choice(&ToolChoice::Mode("auto".to_string())),
            json!({ "functionCallingConfig": { "mode": "AUTO" } })
        );
        assert_eq!(
            convert_tool_choice(&ToolChoice::Mode("required".to_string())),
            json!({ "functionCallingConfig": { "mode": "ANY" } })
        );
        assert_eq!(
            convert_tool_choice(&ToolChoice::Mode("none".to_string())),
            json!({ "functionCallingConfig": { "mode": "NONE" } })
        );
    }

    #[test]
    fn response_candidates_become_choices() {
        let body = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "Hello" },
                        { "functionCall": { "name": "lookup", "args": { "q": 1 } } }
                    ]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 7,
                "candidatesTokenCount": 3,
                "totalTokenCount": 10
            }
        })
        .to_string();
        let response = parse_response(200, body.as_bytes()).unwrap();
        let message = response.choices[0].message.as_ref().unwrap();
        assert_eq!(message.content_text(), "Hello");
        assert_eq!(message.tool_calls[0].function.name, "lookup");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.as_ref().unwrap().total_tokens, 10);
        assert!(response.id.starts_with("gemini-"));
    }

    #[test]
    fn stream_accepts_bare_objects_and_array_fragments() {
        let outbound = GenerateContentOutbound;

        let bare = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Hi" }] } }]
        })
        .to_string();
        let chunk = outbound.transform_stream(bare.as_bytes()).unwrap().unwrap();
        assert_eq!(chunk.object, OBJECT_CHAT_COMPLETION_CHUNK);
        assert_eq!(chunk.choices[0].delta.as_ref().unwrap().content_text(), "Hi");

        let leading = format!("[{bare}");
        assert!(outbound
            .transform_stream(leading.as_bytes())
            .unwrap()
            .is_some());
        let continuation = format!(",{bare}");
        assert!(outbound
            .transform_stream(continuation.as_bytes())
            .unwrap()
            .is_some());
        assert!(outbound.transform_stream(b"]").unwrap().is_none());
        assert!(outbound.transform_stream(b"not json").unwrap().is_none());
    }

    #[test]
    fn finish_reasons_map_to_canonical() {
        assert_eq!(finish_reason("STOP"), "stop");
        assert_eq!(finish_reason("MAX_TOKENS"), "length");
        assert_eq!(finish_reason("SAFETY"), "content_filter");
        assert_eq!(finish_reason("UNSPECIFIED"), "stop");
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(map_error_status("RESOURCE_EXHAUSTED"), "rate_limit_exceeded");
        assert_eq!(map_error_status("UNAUTHENTICATED"), "invalid_api_key");
        assert_eq!(map_error_status("INVALID_ARGUMENT"), "invalid_request_error");
        assert_eq!(map_error_status("UNAVAILABLE"), "server_error");
        assert_eq!(map_error_status("OTHER"), "api_error");

        let body = json!({
            "error": { "code": 429, "message": "quota", "status": "RESOURCE_EXHAUSTED" }
        })
        .to_string();
        let response = parse_response(429, body.as_bytes()).unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.status, 429);
        assert_eq!(error.detail.kind, "rate_limit_exceeded");
        assert_eq!(error.detail.code, "RESOURCE_EXHAUSTED");
    }
}
