use crate::error::{AppError, AppResult};
use crate::relay::outbound::{parse_data_url, parse_sse_event};
use crate::relay::{
    Choice, ContentPart, ErrorDetail, FunctionCall, Message, MessageContent, Outbound,
    RelayRequest, RelayResponse, ToolCall, ToolChoice, Usage, OBJECT_CHAT_COMPLETION,
    OBJECT_CHAT_COMPLETION_CHUNK,
};
use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic requires max_tokens; this is the default when the canonical
/// request carries neither limit.
const DEFAULT_MAX_TOKENS: i64 = 4096;

pub struct MessagesOutbound;

#[async_trait]
impl Outbound for MessagesOutbound {
    fn transform_request(
        &self,
        client: &reqwest::Client,
        request: &RelayRequest,
        base_url: &str,
        key: &str,
    ) -> AppResult<reqwest::RequestBuilder> {
        let url = build_messages_url(base_url);
        let body = build_body(request)
            .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err))?;
        Ok(client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
        let (event_type, data) = parse_sse_event(event_data);
        Ok(dispatch_event(&event_type, &data))
    }
}

pub(crate) fn build_messages_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/messages") {
        return base.to_string();
    }
    if base.ends_with("/v1") {
        return format!("{base}/messages");
    }
    format!("{base}/v1/messages")
}

pub(crate) fn build_body(request: &RelayRequest) -> Result<Value, String> {
    let mut system: Option<String> = None;
    let mut messages = Vec::new();

    for message in &request.messages {
        if message.role == "system" {
            let text = message.content_text();
            if !text.is_empty() {
                system = Some(text);
            }
            continue;
        }
        messages.push(convert_message(message)?);
    }

    let max_tokens = request
        .max_tokens
        .or(request.max_completion_tokens)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": max_tokens,
    });
    let obj = body.as_object_mut().expect("messages request object");

    if let Some(system) = system {
        obj.insert("system".to_string(), Value::String(system));
    }
    if let Some(stream) = request.stream {
        obj.insert("stream".to_string(), Value::Bool(stream));
    }
    if let Some(temperature) = request.temperature {
        obj.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.top_p {
        obj.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(stop) = &request.stop {
        obj.insert(
            "stop_sequences".to_string(),
            Value::from(stop.sequences()),
        );
    }
    if let Some(tools) = &request.tools {
        let converted: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "input_schema": tool.function.parameters
                })
            })
            .collect();
        obj.insert("tools".to_string(), Value::Array(converted));
    }
    if let Some(choice) = &request.tool_choice {
        if let Some(converted) = convert_tool_choice(choice) {
            obj.insert("tool_choice".to_string(), converted);
        }
    }
    if let Some(user) = &request.user {
        obj.insert("metadata".to_string(), json!({ "user_id": user }));
    }

    Ok(body)
}

fn convert_message(message: &Message) -> Result<Value, String> {
    // Tool results travel as user-role tool_result blocks.
    if let Some(tool_call_id) = &message.tool_call_id {
        return Ok(json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": message.content_text()
            }]
        }));
    }

    if message.role == "assistant" && !message.tool_calls.is_empty() {
        let mut blocks = Vec::new();
        let text = message.content_text();
        if !text.is_empty() {
            blocks.push(json!({ "type": "text", "text": text }));
        }
        for call in &message.tool_calls {
            let input = serde_json::from_str::<Value>(&call.function.arguments)
                .unwrap_or_else(|_| json!({}));
            blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.function.name,
                "input": input
            }));
        }
        return Ok(json!({ "role": message.role, "content": blocks }));
    }

    match &message.content {
        Some(MessageContent::Text(text)) => {
            Ok(json!({ "role": message.role, "content": text }))
        }
        Some(MessageContent::Parts(parts)) => {
            let mut blocks = Vec::with_capacity(parts.len());
            for part in parts {
                blocks.push(convert_part(part)?);
            }
            Ok(json!({ "role": message.role, "content": blocks }))
        }
        None => Ok(json!({ "role": message.role, "content": "" })),
    }
}

fn convert_part(part: &ContentPart) -> Result<Value, String> {
    match part {
        ContentPart::Text { text } => Ok(json!({ "type": "text", "text": text })),
        ContentPart::ImageUrl { image_url } => {
            let (media_type, data) = parse_data_url(&image_url.url)
                .map_err(|err| format!("failed to parse image URL: {err}"))?;
            Ok(json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data }
            }))
        }
    }
}

fn convert_tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => Some(json!({ "type": "auto" })),
            "required" => Some(json!({ "type": "any" })),
            _ => None,
        },
        ToolChoice::Named(named) => {
            Some(json!({ "type": "tool", "name": named.function.name }))
        }
    }
}

pub(crate) fn parse_response(status: u16, body: &[u8]) -> AppResult<RelayResponse> {
    if status >= 400 {
        return Ok(parse_error_response(status, body));
    }

    let value: Value = serde_json::from_slice(body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_GATEWAY,
            "invalid_upstream_response",
            format!("failed to parse messages response: {err}"),
        )
    })?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in value
        .get("content")
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
    {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text.push_str(t);
                }
            }
            "thinking" => {
                if let Some(t) = block.get("thinking").and_then(|v| v.as_str()) {
                    reasoning.push_str(t);
                }
            }
            "tool_use" => {
                let id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if !id.is_empty() && !name.is_empty() {
                    let arguments = block
                        .get("input")
                        .map(|input| input.to_string())
                        .unwrap_or_default();
                    tool_calls.push(ToolCall {
                        id: id.to_string(),
                        kind: "function".to_string(),
                        index: tool_calls.len() as u32,
                        function: FunctionCall {
                            name: name.to_string(),
                            arguments,
                        },
                    });
                }
            }
            _ => {}
        }
    }

    let mut message = Message {
        role: "assistant".to_string(),
        content: Some(MessageContent::Text(text)),
        tool_calls,
        ..Default::default()
    };
    if !reasoning.is_empty() {
        message.reasoning_content = Some(reasoning);
    }

    let usage = value.get("usage").and_then(|v| v.as_object()).map(|u| {
        let input = u.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        let output = u.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        Usage {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input + output,
            ..Default::default()
        }
    });

    Ok(RelayResponse {
        id: value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        object: OBJECT_CHAT_COMPLETION.to_string(),
        created: chrono::Utc::now().timestamp(),
        model: value
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        choices: vec![Choice {
            index: 0,
            message: Some(message),
            finish_reason: value
                .get("stop_reason")
                .and_then(|v| v.as_str())
                .map(|r| finish_reason(r).to_string()),
            ..Default::default()
        }],
        usage,
        ..Default::default()
    })
}

fn parse_error_response(status: u16, body: &[u8]) -> RelayResponse {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let detail = match parsed.as_ref().and_then(|v| v.get("error")) {
        Some(error) => ErrorDetail {
            message: error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            kind: map_error_type(
                error.get("type").and_then(|v| v.as_str()).unwrap_or(""),
            )
            .to_string(),
            ..Default::default()
        },
        None => ErrorDetail {
            message: String::from_utf8_lossy(body).to_string(),
            kind: "api_error".to_string(),
            ..Default::default()
        },
    };
    RelayResponse::error_response(status, detail)
}

pub(crate) fn map_error_type(anthropic_type: &str) -> &'static str {
    match anthropic_type {
        "invalid_api_key" | "authentication_error" | "permission_error" => "invalid_api_key",
        "rate_limit_error" => "rate_limit_exceeded",
        "overloaded_error" => "server_error",
        "invalid_request_error" | "not_found_error" => "invalid_request_error",
        _ => "api_error",
    }
}

fn finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

fn dispatch_event(event_type: &str, data: &[u8]) -> Option<RelayResponse> {
    match event_type {
        "message_start" => handle_message_start(data),
        "content_block_start" => handle_content_block_start(data),
        "content_block_delta" => handle_content_block_delta(data),
        "message_delta" => handle_message_delta(data),
        "error" => handle_error(data),
        "content_block_stop" | "message_stop" | "ping" => None,
        _ => {
            // Event type may only live inside the data payload.
            let probe: Value = serde_json::from_slice(data).ok()?;
            let kind = probe.get("type").and_then(|v| v.as_str())?;
            if kind.is_empty() || kind == event_type {
                return None;
            }
            dispatch_event(kind, data)
        }
    }
}

fn chunk_with_delta(index: u32, delta: Message) -> RelayResponse {
    RelayResponse {
        object: OBJECT_CHAT_COMPLETION_CHUNK.to_string(),
        created: chrono::Utc::now().timestamp(),
        choices: vec![Choice {
            index,
            delta: Some(delta),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn handle_message_start(data: &[u8]) -> Option<RelayResponse> {
    let event: Value = serde_json::from_slice(data).ok()?;
    let message = event.get("message")?;
    let mut chunk = chunk_with_delta(
        0,
        Message {
            role: "assistant".to_string(),
            ..Default::default()
        },
    );
    chunk.id = message
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    chunk.model = message
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some(chunk)
}

fn handle_content_block_start(data: &[u8]) -> Option<RelayResponse> {
    let event: Value = serde_json::from_slice(data).ok()?;
    let block = event.get("content_block")?;
    if block.get("type").and_then(|v| v.as_str()) != Some("tool_use") {
        return None;
    }
    let id = block.get("id").and_then(|v| v.as_str())?;
    let name = block.get("name").and_then(|v| v.as_str())?;
    let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

    Some(chunk_with_delta(
        0,
        Message {
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                kind: "function".to_string(),
                index,
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: String::new(),
                },
            }],
            ..Default::default()
        },
    ))
}

fn handle_content_block_delta(data: &[u8]) -> Option<RelayResponse> {
    let event: Value = serde_json::from_slice(data).ok()?;
    let delta = event.get("delta")?;
    let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

    match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "text_delta" => {
            let text = delta.get("text").and_then(|v| v.as_str())?;
            Some(chunk_with_delta(
                0,
                Message {
                    content: Some(MessageContent::Text(text.to_string())),
                    ..Default::default()
                },
            ))
        }
        "input_json_delta" => {
            let partial = delta.get("partial_json").and_then(|v| v.as_str())?;
            Some(chunk_with_delta(
                0,
                Message {
                    tool_calls: vec![ToolCall {
                        index,
                        function: FunctionCall {
                            arguments: partial.to_string(),
                            ..Default::default()
                        },
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ))
        }
        "thinking_delta" => {
            let thinking = delta.get("thinking").and_then(|v| v.as_str())?;
            Some(chunk_with_delta(
                0,
                Message {
                    reasoning_content: Some(thinking.to_string()),
                    ..Default::default()
                },
            ))
        }
        _ => None,
    }
}

fn handle_message_delta(data: &[u8]) -> Option<RelayResponse> {
    let event: Value = serde_json::from_slice(data).ok()?;

    let mut chunk = chunk_with_delta(0, Message::default());
    if let Some(stop_reason) = event
        .get("delta")
        .and_then(|v| v.get("stop_reason"))
        .and_then(|v| v.as_str())
    {
        chunk.choices[0].finish_reason = Some(finish_reason(stop_reason).to_string());
    }
    if let Some(usage) = event.get("usage").and_then(|v| v.as_object()) {
        let input = usage
            .get("input_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let output = usage
            .get("output_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        chunk.usage = Some(Usage {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input + output,
            ..Default::default()
        });
    }
    Some(chunk)
}

fn handle_error(data: &[u8]) -> Option<RelayResponse> {
    let event: Value = serde_json::from_slice(data).ok()?;
    let error = event.get("error")?;
    Some(RelayResponse::error_response(
        500,
        ErrorDetail {
            message: error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            kind: map_error_type(error.get("type").and_then(|v| v.as_str()).unwrap_or(""))
                .to_string(),
            ..Default::default()
        },
    ))
}
