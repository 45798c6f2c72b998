use crate::relay::{ApiFormat, Inbound, Outbound};
use bytes::Bytes;
use futures_util::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

/// Upstream events can be large; a single buffered event must fit 1 MiB.
const EVENT_BUFFER_CAPACITY: usize = 1024 * 1024;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Drive one upstream stream to completion: scan the byte stream line-wise,
/// reassemble framed events, translate each through
/// outbound -> canonical -> inbound, and write client frames to `tx`.
///
/// Input framing handled here:
/// - `event:` lines set the pending event type,
/// - `data:` lines either terminate (`[DONE]`), accumulate under a pending
///   event type, or dispatch immediately,
/// - blank lines flush the accumulated event,
/// - bare `{`/`[` lines, and the `,`/`]` continuation and terminator lines
///   of Gemini's array stream form, dispatch immediately.
///
/// The `[DONE]` sentinel is written at most once and only for OpenAI-style
/// inbound adapters. A failed send means the client is gone; the loop stops
/// and the upstream read is dropped with it.
pub async fn run<S>(
    upstream: S,
    outbound: &dyn Outbound,
    inbound: &mut dyn Inbound,
    tx: &mpsc::Sender<Bytes>,
) where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    let reader = BufReader::with_capacity(EVENT_BUFFER_CAPACITY, StreamReader::new(upstream));
    let mut lines = reader.lines();

    let mut event_type: Option<String> = None;
    let mut event_buffer = String::new();
    let mut done_sent = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!("upstream stream read ended: {err}");
                break;
            }
        };
        let line = line.trim_end_matches('\r');

        if line.trim().is_empty() {
            if !event_buffer.is_empty() {
                let framed = frame_event(event_type.as_deref(), &event_buffer);
                event_buffer.clear();
                event_type = None;
                if !dispatch(framed.as_bytes(), outbound, inbound, tx).await {
                    return;
                }
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("event:") {
            event_type = Some(rest.trim().to_string());
            continue;
        }

        if let Some(rest) = line.strip_prefix("data:") {
            let data = rest.strip_prefix(' ').unwrap_or(rest);
            if data.trim() == "[DONE]" {
                if inbound.format() == ApiFormat::OpenAiChat && !done_sent {
                    if tx.send(Bytes::from_static(DONE_FRAME)).await.is_err() {
                        return;
                    }
                    done_sent = true;
                }
                continue;
            }
            if event_type.is_some() {
                event_buffer.push_str(data);
            } else if !dispatch(data.as_bytes(), outbound, inbound, tx).await {
                return;
            }
            continue;
        }

        if line.starts_with('{')
            || line.starts_with('[')
            || line.starts_with(',')
            || line.starts_with(']')
        {
            if !dispatch(line.as_bytes(), outbound, inbound, tx).await {
                return;
            }
        }
    }

    if !event_buffer.is_empty() {
        let framed = frame_event(event_type.as_deref(), &event_buffer);
        if !dispatch(framed.as_bytes(), outbound, inbound, tx).await {
            return;
        }
    }

    if inbound.format() == ApiFormat::OpenAiChat && !done_sent {
        let _ = tx.send(Bytes::from_static(DONE_FRAME)).await;
    }
}

fn frame_event(event_type: Option<&str>, data: &str) -> String {
    match event_type {
        Some(kind) => format!("event: {kind}\ndata: {data}"),
        None => format!("data: {data}"),
    }
}

/// Returns false when the client is gone and the bridge should stop.
async fn dispatch(
    event_data: &[u8],
    outbound: &dyn Outbound,
    inbound: &mut dyn Inbound,
    tx: &mpsc::Sender<Bytes>,
) -> bool {
    let chunk = match outbound.transform_stream(event_data) {
        Ok(Some(chunk)) => chunk,
        Ok(None) => return true,
        Err(err) => {
            tracing::debug!("failed to transform upstream chunk: {}", err.message);
            return true;
        }
    };

    if chunk.is_error() {
        let Ok(body) = inbound.transform_response(&chunk) else {
            return true;
        };
        let mut frame = Vec::with_capacity(body.len() + 8);
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(&body);
        frame.extend_from_slice(b"\n\n");
        return tx.send(frame.into()).await.is_ok();
    }

    match inbound.transform_stream(&chunk) {
        Ok(frame) if !frame.is_empty() => tx.send(frame.into()).await.is_ok(),
        Ok(_) => true,
        Err(err) => {
            tracing::debug!("failed to transform chunk for client: {}", err.message);
            true
        }
    }
}
