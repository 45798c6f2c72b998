use crate::error::{AppError, AppResult};
use crate::relay::{
    ErrorDetail, Outbound, RelayRequest, RelayResponse, ResponseError,
    OBJECT_CHAT_COMPLETION_CHUNK, OBJECT_ERROR,
};
use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::header::CONTENT_TYPE;

/// OpenAI Chat provider-side adapter. The canonical model serializes
/// directly as the upstream body.
pub struct ChatOutbound;

#[async_trait]
impl Outbound for ChatOutbound {
    fn transform_request(
        &self,
        client: &reqwest::Client,
        request: &RelayRequest,
        base_url: &str,
        key: &str,
    ) -> AppResult<reqwest::RequestBuilder> {
        let url = build_chat_url(base_url);
        Ok(client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(key)
            .json(request))
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
        let trimmed = event_data.strip_prefix(b"data:".as_slice()).unwrap_or(event_data);
        let trimmed = std::str::from_utf8(trimmed).unwrap_or_default().trim();
        if trimmed == "[DONE]" {
            return Ok(None);
        }

        let mut chunk: RelayResponse = serde_json::from_str(trimmed).map_err(|err| {
            AppError::new(
                StatusCode::BAD_GATEWAY,
                "invalid_upstream_chunk",
                format!("failed to parse stream chunk: {err}"),
            )
        })?;
        if chunk.object.is_empty() {
            chunk.object = OBJECT_CHAT_COMPLETION_CHUNK.to_string();
        }
        Ok(Some(chunk))
    }
}

pub(crate) fn parse_response(status: u16, body: &[u8]) -> AppResult<RelayResponse> {
    if status >= 400 {
        return Ok(parse_error_response(status, body));
    }
    serde_json::from_slice(body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_GATEWAY,
            "invalid_upstream_response",
            format!("failed to parse chat completion response: {err}"),
        )
    })
}

fn parse_error_response(status: u16, body: &[u8]) -> RelayResponse {
    #[derive(serde::Deserialize)]
    struct Envelope {
        error: ErrorDetail,
    }

    match serde_json::from_slice::<Envelope>(body) {
        Ok(envelope) => RelayResponse {
            object: OBJECT_ERROR.to_string(),
            created: chrono::Utc::now().timestamp(),
            error: Some(ResponseError {
                status,
                detail: envelope.error,
            }),
            ..Default::default()
        },
        Err(_) => RelayResponse::error_response(
            status,
            ErrorDetail {
                message: String::from_utf8_lossy(body).to_string(),
                kind: "api_error".to_string(),
                ..Default::default()
            },
        ),
    }
}

pub(crate) fn build_chat_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        return base.to_string();
    }
    if base.ends_with("/v1") {
        return format!("{base}/chat/completions");
    }
    format!("{base}/v1/chat/completions")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Message;
    use serde_json::json;

    #[test]
    fn url_construction_rules() {
        assert_eq!(
            build_chat_url("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            build_chat_url("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            build_chat_url("https://proxy.example.com/"),
            "https://proxy.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn request_carries_bearer_auth_and_canonical_body() {
        let client = reqwest::Client::new();
        let request = RelayRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::text("user", "hi")],
            ..Default::default()
        };
        let built = ChatOutbound
            .transform_request(&client, &request, "https://api.openai.com", "sk-test")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            built.url().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            built.headers().get("authorization").unwrap(),
            "Bearer sk-test"
        );
        let body: serde_json::Value =
            serde_json::from_slice(built.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn done_marker_yields_no_chunk() {
        assert!(ChatOutbound.transform_stream(b"[DONE]").unwrap().is_none());
        assert!(ChatOutbound.transform_stream(b" [DONE] ").unwrap().is_none());
    }

    #[test]
    fn chunk_defaults_object_kind() {
        let chunk = ChatOutbound
            .transform_stream(
                json!({ "id": "c1", "choices": [{ "index": 0, "delta": { "content": "x" } }] })
                    .to_string()
                    .as_bytes(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(chunk.object, OBJECT_CHAT_COMPLETION_CHUNK);
        assert_eq!(
            chunk.choices[0].delta.as_ref().unwrap().content_text(),
            "x"
        );
    }

    #[test]
    fn error_body_maps_to_canonical_error() {
        let body = json!({
            "error": { "message": "bad key", "type": "invalid_api_key", "code": "401" }
        })
        .to_string();
        let response = parse_response(401, body.as_bytes()).unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.status, 401);
        assert_eq!(error.detail.kind, "invalid_api_key");
        assert_eq!(error.detail.message, "bad key");
    }

    #[test]
    fn non_json_error_body_becomes_api_error() {
        let response = parse_response(502, b"bad gateway").unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.status, 502);
        assert_eq!(error.detail.kind, "api_error");
        assert_eq!(error.detail.message, "bad gateway");
    }
}
