use crate::app::AppState;
use crate::error::AppError;
use crate::groups::Group;
use crate::keypool::ApiKey;
use crate::relay::{
    detector, inbound, outbound, ErrorDetail, Inbound, Outbound, RelayRequest, RelayResponse,
    ResponseError, OBJECT_ERROR,
};
use crate::stream_bridge;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// Main proxy entry point: `POST /proxy/{group}/{*path}`. The sub-path
/// decides the client dialect; the group decides the upstream dialect.
pub async fn proxy(
    State(state): State<AppState>,
    Path((group_name, sub_path)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let started_at = std::time::Instant::now();

    let group = match state.groups.get_by_name(&group_name).await {
        Ok(Some(group)) => group,
        Ok(None) => {
            return AppError::new(
                StatusCode::NOT_FOUND,
                "group_not_found",
                format!("unknown group: {group_name}"),
            )
            .into_response();
        }
        Err(err) => {
            return AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "group_store_error", err)
                .into_response();
        }
    };

    let inbound_type = detector::detect_format(&sub_path, &body);
    let Some(mut inbound) = inbound::get_inbound(inbound_type) else {
        return AppError::new(
            StatusCode::BAD_REQUEST,
            "unsupported_format",
            format!("unsupported inbound format: {}", inbound_type.as_str()),
        )
        .into_response();
    };

    let mut request = match inbound.transform_request(&body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    if let Some(target) = group.redirect_model(&request.model) {
        tracing::debug!(
            group = %group.name,
            original_model = %request.model,
            target_model = %target,
            "model redirected"
        );
        request.model = target.to_string();
    }

    let outbound_type = outbound::OutboundType::from_api_format(group.api_format);
    let Some(outbound) = outbound::get_outbound(outbound_type) else {
        return AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unsupported_format",
            format!("unsupported outbound format: {}", outbound_type.as_str()),
        )
        .into_response();
    };

    execute(state, group, request, inbound, outbound, started_at).await
}

async fn execute(
    state: AppState,
    group: Group,
    request: RelayRequest,
    mut inbound: Box<dyn Inbound>,
    outbound: Arc<dyn Outbound>,
    started_at: std::time::Instant,
) -> Response {
    let is_stream = request.is_streaming();
    let mut last_error: Option<ResponseError> = None;
    let attempts = group.max_retries.max(0) as u32 + 1;

    for attempt in 0..attempts {
        let key = match state.key_pool.select_key(group.id).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                let error = ResponseError {
                    status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                    detail: ErrorDetail {
                        message: format!("no available keys for group: {}", group.name),
                        kind: "server_error".to_string(),
                        ..Default::default()
                    },
                };
                return client_error_response(inbound.as_mut(), error);
            }
            Err(err) => {
                return AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "key_pool_error", err)
                    .into_response();
            }
        };

        let builder = match outbound.transform_request(
            &state.http,
            &request,
            &group.upstream_url,
            &key.key_value,
        ) {
            Ok(builder) => builder,
            Err(err) => return err.into_response(),
        };
        // Streaming requests are bounded by the client connection instead of
        // a fixed deadline.
        let builder = if is_stream {
            builder
        } else {
            builder.timeout(Duration::from_secs(group.request_timeout_secs.max(1)))
        };

        let upstream = match builder.send().await {
            Ok(upstream) => upstream,
            Err(err) => {
                if is_ignorable_error(&err) {
                    tracing::debug!(group = %group.name, "client gone, aborting retries: {err}");
                    return StatusCode::from_u16(499)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                        .into_response();
                }
                tracing::warn!(
                    group = %group.name,
                    key_id = key.id,
                    attempt = attempt + 1,
                    "upstream request failed: {err}"
                );
                state
                    .key_pool
                    .update_status(key.id, group.id, group.blacklist_threshold, false, err.to_string())
                    .await;
                last_error = Some(ResponseError {
                    status: StatusCode::BAD_GATEWAY.as_u16(),
                    detail: ErrorDetail {
                        message: err.to_string(),
                        kind: "upstream_error".to_string(),
                        ..Default::default()
                    },
                });
                continue;
            }
        };

        let status = upstream.status().as_u16();
        if status >= 400 {
            let error = match outbound.transform_response(upstream).await {
                Ok(canonical) => canonical.error.unwrap_or(ResponseError {
                    status,
                    detail: ErrorDetail {
                        message: "upstream request failed".to_string(),
                        kind: "upstream_error".to_string(),
                        ..Default::default()
                    },
                }),
                Err(err) => ResponseError {
                    status,
                    detail: ErrorDetail {
                        message: err.message,
                        kind: "upstream_error".to_string(),
                        ..Default::default()
                    },
                },
            };
            tracing::warn!(
                group = %group.name,
                key_id = key.id,
                status,
                attempt = attempt + 1,
                error = %error.detail.message,
                "upstream returned error"
            );
            state
                .key_pool
                .update_status(
                    key.id,
                    group.id,
                    group.blacklist_threshold,
                    false,
                    error.detail.message.clone(),
                )
                .await;

            if !should_retry(status) || attempt + 1 == attempts {
                return client_error_response(inbound.as_mut(), error);
            }
            last_error = Some(error);
            continue;
        }

        state
            .key_pool
            .update_status(key.id, group.id, group.blacklist_threshold, true, String::new())
            .await;

        if is_stream {
            return stream_response(group, key, inbound, outbound, upstream, started_at);
        }

        let canonical = match outbound.transform_response(upstream).await {
            Ok(canonical) => canonical,
            Err(err) => return err.into_response(),
        };
        if let Some(error) = canonical.error.clone() {
            return client_error_response(inbound.as_mut(), error);
        }
        let body = match inbound.transform_response(&canonical) {
            Ok(body) => body,
            Err(err) => return err.into_response(),
        };
        tracing::info!(
            group = %group.name,
            key_id = key.id,
            model = %canonical.model,
            duration_ms = started_at.elapsed().as_millis() as u64,
            "request completed"
        );
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response();
    }

    let error = last_error.unwrap_or(ResponseError {
        status: StatusCode::BAD_GATEWAY.as_u16(),
        detail: ErrorDetail {
            message: format!("no upstream attempt succeeded for group: {}", group.name),
            kind: "upstream_error".to_string(),
            ..Default::default()
        },
    });
    client_error_response(inbound.as_mut(), error)
}

/// Streaming response: hand the upstream body to the bridge on its own task
/// and back the client body with the frame channel.
fn stream_response(
    group: Group,
    key: ApiKey,
    mut inbound: Box<dyn Inbound>,
    outbound: Arc<dyn Outbound>,
    upstream: reqwest::Response,
    started_at: std::time::Instant,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(64);

    tokio::spawn(async move {
        let byte_stream = upstream
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();
        stream_bridge::run(byte_stream, outbound.as_ref(), inbound.as_mut(), &tx).await;

        let internal = inbound.internal_response();
        tracing::info!(
            group = %group.name,
            key_id = key.id,
            model = %internal.model,
            choices = internal.choices.len(),
            duration_ms = started_at.elapsed().as_millis() as u64,
            "stream completed"
        );
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Serialize a canonical error through the client's own dialect, preserving
/// the upstream status.
fn client_error_response(inbound: &mut dyn Inbound, error: ResponseError) -> Response {
    let status =
        StatusCode::from_u16(error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let canonical = RelayResponse {
        object: OBJECT_ERROR.to_string(),
        created: chrono::Utc::now().timestamp(),
        error: Some(error.clone()),
        ..Default::default()
    };
    match inbound.transform_response(&canonical) {
        Ok(body) => (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(_) => AppError::new(status, error.detail.kind.clone(), error.detail.message)
            .with_type(error.detail.kind)
            .into_response(),
    }
}

/// Key errors (401/403) and request errors (other 4xx) end the attempt loop;
/// rate limits, server errors and unclassified failures rotate to the next
/// key.
fn should_retry(status: u16) -> bool {
    match status {
        401 | 403 => false,
        429 => true,
        400..=499 => false,
        _ => true,
    }
}

fn is_ignorable_error(err: &reqwest::Error) -> bool {
    err.is_request() && format!("{err}").contains("operation was canceled")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_decision_per_status() {
        assert!(!should_retry(400));
        assert!(!should_retry(401));
        assert!(!should_retry(403));
        assert!(!should_retry(404));
        assert!(should_retry(429));
        assert!(should_retry(500));
        assert!(should_retry(502));
        assert!(should_retry(503));
    }
}
