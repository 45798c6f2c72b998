use crate::error::{AppError, AppResult};
use crate::relay::inbound::StreamAccumulator;
use crate::relay::{ApiFormat, Inbound, RelayRequest, RelayResponse};
use axum::http::StatusCode;

/// OpenAI Chat is the canonical dialect, so parse and serialize are close to
/// the identity.
pub struct ChatInbound {
    accumulator: StreamAccumulator,
}

impl ChatInbound {
    pub fn new() -> Self {
        Self {
            accumulator: StreamAccumulator::new(),
        }
    }
}

impl Default for ChatInbound {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbound for ChatInbound {
    fn format(&self) -> ApiFormat {
        ApiFormat::OpenAiChat
    }

    fn transform_request(&mut self, body: &[u8]) -> AppResult<RelayRequest> {
        let mut request: RelayRequest = serde_json::from_slice(body).map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("failed to parse chat completion request: {err}"),
            )
        })?;
        request.raw_api_format = ApiFormat::OpenAiChat;
        request
            .validate()
            .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err))?;
        Ok(request)
    }

    fn transform_response(&mut self, response: &RelayResponse) -> AppResult<Vec<u8>> {
        self.accumulator.store(response);
        serde_json::to_vec(response).map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialize_failed",
                err.to_string(),
            )
        })
    }

    fn transform_stream(&mut self, chunk: &RelayResponse) -> AppResult<Vec<u8>> {
        self.accumulator.fold(chunk);
        let data = serde_json::to_vec(chunk).map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialize_failed",
                err.to_string(),
            )
        })?;

        // One chunk per frame; the bridge owns the terminal sentinel.
        let mut frame = Vec::with_capacity(data.len() + 8);
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(&data);
        frame.extend_from_slice(b"\n\n");
        Ok(frame)
    }

    fn internal_response(&self) -> RelayResponse {
        self.accumulator.assemble()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{Choice, Message, MessageContent};
    use serde_json::json;

    #[test]
    fn parse_marks_raw_format_and_validates() {
        let mut inbound = ChatInbound::new();
        let body = json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "hi" }],
            "stream": true
        })
        .to_string();
        let request = inbound.transform_request(body.as_bytes()).unwrap();
        assert_eq!(request.raw_api_format, ApiFormat::OpenAiChat);
        assert!(request.is_streaming());

        let missing_model = json!({ "messages": [{ "role": "user", "content": "hi" }] });
        let err = inbound
            .transform_request(missing_model.to_string().as_bytes())
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn stream_frames_are_sse_data_lines() {
        let mut inbound = ChatInbound::new();
        let chunk = RelayResponse {
            object: "chat.completion.chunk".to_string(),
            choices: vec![Choice {
                index: 0,
                delta: Some(Message {
                    content: Some(MessageContent::Text("Hi".to_string())),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let frame = inbound.transform_stream(&chunk).unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("\n\n"));
        assert!(!text.contains("[DONE]"));

        let internal = inbound.internal_response();
        assert_eq!(
            internal.choices[0].message.as_ref().unwrap().content_text(),
            "Hi"
        );
    }

    #[test]
    fn non_stream_response_is_stored_for_retrieval() {
        let mut inbound = ChatInbound::new();
        let response = RelayResponse {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Some(Message::text("assistant", "done")),
                finish_reason: Some("stop".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let bytes = inbound.transform_response(&response).unwrap();
        let round: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(round["choices"][0]["message"]["content"], "done");

        let internal = inbound.internal_response();
        assert_eq!(internal.id, "chatcmpl-1");
        assert_eq!(
            internal.choices[0].message.as_ref().unwrap().content_text(),
            "done"
        );
        assert_eq!(internal.choices[0].finish_reason.as_deref(), Some("stop"));
    }
}
