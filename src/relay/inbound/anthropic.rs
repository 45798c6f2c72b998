use crate::error::{AppError, AppResult};
use crate::relay::inbound::StreamAccumulator;
use crate::relay::{
    ApiFormat, ContentPart, FunctionCall, ImageUrl, Inbound, Message, MessageContent,
    RelayRequest, RelayResponse, Stop, Tool, ToolCall, ToolChoice, Function,
};
use axum::http::StatusCode;
use serde_json::{json, Map, Value};

pub const EVENT_CONTENT_BLOCK_DELTA: &str = "content_block_delta";
pub const EVENT_MESSAGE_DELTA: &str = "message_delta";

/// Anthropic Messages client-side adapter.
pub struct MessagesInbound {
    accumulator: StreamAccumulator,
}

impl MessagesInbound {
    pub fn new() -> Self {
        Self {
            accumulator: StreamAccumulator::new(),
        }
    }
}

impl Default for MessagesInbound {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbound for MessagesInbound {
    fn format(&self) -> ApiFormat {
        ApiFormat::Anthropic
    }

    fn transform_request(&mut self, body: &[u8]) -> AppResult<RelayRequest> {
        let value: Value = serde_json::from_slice(body).map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("failed to parse messages request: {err}"),
            )
        })?;
        let request = parse_request(&value)
            .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err))?;
        request
            .validate()
            .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err))?;
        Ok(request)
    }

    fn transform_response(&mut self, response: &RelayResponse) -> AppResult<Vec<u8>> {
        self.accumulator.store(response);
        let body = encode_response(response);
        serde_json::to_vec(&body).map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialize_failed",
                err.to_string(),
            )
        })
    }

    fn transform_stream(&mut self, chunk: &RelayResponse) -> AppResult<Vec<u8>> {
        self.accumulator.fold(chunk);

        let mut frames = Vec::new();
        for choice in &chunk.choices {
            if let Some(delta) = &choice.delta {
                let text = delta.content_text();
                if !text.is_empty() {
                    push_event(
                        &mut frames,
                        EVENT_CONTENT_BLOCK_DELTA,
                        &json!({
                            "type": EVENT_CONTENT_BLOCK_DELTA,
                            "index": choice.index,
                            "delta": { "type": "text_delta", "text": text }
                        }),
                    );
                }
                if let Some(thinking) = delta.reasoning_content.as_deref() {
                    if !thinking.is_empty() {
                        push_event(
                            &mut frames,
                            EVENT_CONTENT_BLOCK_DELTA,
                            &json!({
                                "type": EVENT_CONTENT_BLOCK_DELTA,
                                "index": choice.index,
                                "delta": { "type": "thinking_delta", "thinking": thinking }
                            }),
                        );
                    }
                }
                for call in &delta.tool_calls {
                    if !call.function.arguments.is_empty() {
                        push_event(
                            &mut frames,
                            EVENT_CONTENT_BLOCK_DELTA,
                            &json!({
                                "type": EVENT_CONTENT_BLOCK_DELTA,
                                "index": call.index,
                                "delta": {
                                    "type": "input_json_delta",
                                    "partial_json": call.function.arguments
                                }
                            }),
                        );
                    }
                }
            }

            if let Some(reason) = &choice.finish_reason {
                let mut event = json!({
                    "type": EVENT_MESSAGE_DELTA,
                    "delta": { "stop_reason": stop_reason(reason) }
                });
                if let Some(usage) = &chunk.usage {
                    event["usage"] = json!({
                        "input_tokens": usage.prompt_tokens,
                        "output_tokens": usage.completion_tokens
                    });
                }
                push_event(&mut frames, EVENT_MESSAGE_DELTA, &event);
            }
        }

        Ok(frames)
    }

    fn internal_response(&self) -> RelayResponse {
        self.accumulator.assemble()
    }
}

fn push_event(out: &mut Vec<u8>, event_type: &str, data: &Value) {
    out.extend_from_slice(format!("event: {event_type}\ndata: {data}\n\n").as_bytes());
}

fn parse_request(value: &Value) -> Result<RelayRequest, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "messages request must be an object".to_string())?;

    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let mut messages = Vec::new();

    if let Some(system) = obj.get("system") {
        let system_text = system_text(system);
        if !system_text.is_empty() {
            messages.push(Message::text("system", system_text));
        }
    }

    for raw in obj
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
    {
        let Some(msg_obj) = raw.as_object() else {
            continue;
        };
        messages.push(parse_message(msg_obj));
    }

    let tools = obj.get("tools").and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|raw| {
                let tool = raw.as_object()?;
                Some(Tool {
                    kind: "function".to_string(),
                    function: Function {
                        name: tool.get("name")?.as_str()?.to_string(),
                        description: tool
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        parameters: tool.get("input_schema").cloned().unwrap_or(Value::Null),
                        strict: None,
                    },
                    cache_control: None,
                })
            })
            .collect::<Vec<_>>()
    });

    let stop = obj
        .get("stop_sequences")
        .and_then(|v| v.as_array())
        .map(|arr| {
            Stop::Many(
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
            )
        });

    Ok(RelayRequest {
        model,
        messages,
        temperature: obj.get("temperature").and_then(|v| v.as_f64()),
        top_p: obj.get("top_p").and_then(|v| v.as_f64()),
        max_tokens: obj.get("max_tokens").and_then(|v| v.as_i64()),
        stream: obj.get("stream").and_then(|v| v.as_bool()),
        stop,
        tools,
        tool_choice: obj.get("tool_choice").and_then(parse_tool_choice),
        user: obj
            .get("metadata")
            .and_then(|v| v.get("user_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        raw_api_format: ApiFormat::Anthropic,
        ..Default::default()
    })
}

fn system_text(system: &Value) -> String {
    if let Some(s) = system.as_str() {
        return s.to_string();
    }
    if let Some(blocks) = system.as_array() {
        return blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
    }
    String::new()
}

fn parse_message(msg_obj: &Map<String, Value>) -> Message {
    let role = msg_obj
        .get("role")
        .and_then(|v| v.as_str())
        .unwrap_or("user")
        .to_string();

    let mut message = Message {
        role,
        ..Default::default()
    };

    let content = msg_obj.get("content").cloned().unwrap_or(Value::Null);
    if let Some(text) = content.as_str() {
        message.content = Some(MessageContent::Text(text.to_string()));
        return message;
    }

    let Some(blocks) = content.as_array() else {
        return message;
    };

    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();
    let mut reasoning = String::new();

    for block in blocks {
        let Some(bobj) = block.as_object() else {
            continue;
        };
        match bobj.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(text) = bobj.get("text").and_then(|v| v.as_str()) {
                    parts.push(ContentPart::Text {
                        text: text.to_string(),
                    });
                }
            }
            "image" => {
                if let Some(url) = image_source_to_data_url(bobj.get("source")) {
                    parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrl { url, detail: None },
                    });
                }
            }
            "tool_use" => {
                let id = bobj
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let name = bobj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if !id.is_empty() && !name.is_empty() {
                    let arguments = bobj
                        .get("input")
                        .map(|input| input.to_string())
                        .unwrap_or_default();
                    tool_calls.push(ToolCall {
                        id,
                        kind: "function".to_string(),
                        index: tool_calls.len() as u32,
                        function: FunctionCall { name, arguments },
                    });
                }
            }
            "tool_result" => {
                if let Some(tool_use_id) = bobj.get("tool_use_id").and_then(|v| v.as_str()) {
                    message.role = "tool".to_string();
                    message.tool_call_id = Some(tool_use_id.to_string());
                    let text = tool_result_text(bobj.get("content"));
                    message.content = Some(MessageContent::Text(text));
                }
            }
            "thinking" => {
                if let Some(thinking) = bobj.get("thinking").and_then(|v| v.as_str()) {
                    reasoning.push_str(thinking);
                }
                if let Some(signature) = bobj.get("signature").and_then(|v| v.as_str()) {
                    if !signature.is_empty() {
                        message.reasoning_signature = Some(signature.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    if message.content.is_none() {
        if let [ContentPart::Text { text }] = parts.as_slice() {
            message.content = Some(MessageContent::Text(text.clone()));
        } else if !parts.is_empty() {
            message.content = Some(MessageContent::Parts(parts));
        }
    }
    if !tool_calls.is_empty() {
        message.tool_calls = tool_calls;
    }
    if !reasoning.is_empty() {
        message.reasoning_content = Some(reasoning);
    }

    message
}

/// Anthropic base64 image sources become canonical data URLs; url sources
/// pass through unchanged.
fn image_source_to_data_url(source: Option<&Value>) -> Option<String> {
    let source = source?.as_object()?;
    match source.get("type").and_then(|v| v.as_str()) {
        Some("url") => source
            .get("url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => {
            let media_type = source
                .get("media_type")
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream");
            let data = source.get("data").and_then(|v| v.as_str())?;
            Some(format!("data:{media_type};base64,{data}"))
        }
    }
}

fn tool_result_text(content: Option<&Value>) -> String {
    let Some(content) = content else {
        return String::new();
    };
    if let Some(text) = content.as_str() {
        return text.to_string();
    }
    if let Some(blocks) = content.as_array() {
        let mut out = String::new();
        for block in blocks {
            if let Some(text) = block.as_str() {
                out.push_str(text);
            } else if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
        }
        return out;
    }
    content.to_string()
}

fn parse_tool_choice(value: &Value) -> Option<ToolChoice> {
    let obj = value.as_object()?;
    match obj.get("type").and_then(|v| v.as_str())? {
        "auto" => Some(ToolChoice::Mode("auto".to_string())),
        "any" => Some(ToolChoice::Mode("required".to_string())),
        "tool" => obj
            .get("name")
            .and_then(|v| v.as_str())
            .map(ToolChoice::named),
        _ => None,
    }
}

fn encode_response(response: &RelayResponse) -> Value {
    if let Some(error) = &response.error {
        return json!({
            "type": "error",
            "error": {
                "type": error.detail.kind,
                "message": error.detail.message
            }
        });
    }

    let mut content = Vec::new();
    let mut stop = None;
    for choice in &response.choices {
        let Some(message) = &choice.message else {
            continue;
        };

        if let Some(thinking) = message.reasoning_content.as_deref() {
            if !thinking.is_empty() {
                let mut block = json!({ "type": "thinking", "thinking": thinking });
                if let Some(signature) = message.reasoning_signature.as_deref() {
                    block["signature"] = Value::String(signature.to_string());
                }
                content.push(block);
            }
        }

        let text = message.content_text();
        if !text.is_empty() {
            content.push(json!({ "type": "text", "text": text }));
        }

        for call in &message.tool_calls {
            let input = serde_json::from_str::<Value>(&call.function.arguments)
                .unwrap_or_else(|_| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.function.name,
                "input": input
            }));
        }

        if let Some(reason) = &choice.finish_reason {
            stop = Some(stop_reason(reason));
        }
    }

    let mut body = json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": content,
        "stop_reason": stop
    });
    if let Some(usage) = &response.usage {
        body["usage"] = json!({
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens
        });
    }
    body
}

fn stop_reason(finish_reason: &str) -> &'static str {
    match finish_reason {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}
