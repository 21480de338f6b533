//! # HTTP Replay Worker
//!
//! Replays one completed [`PendingRequest`] against the local origin and
//! streams the response back through the shared [`OutboundTx`], forwarding
//! method/headers/body and folding the response back into bounded chunks.

use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::outbound::{send_chunk, send_control, OutboundTx};
use crate::protocol::{ControlMessage, ResponseHeaderValue, ResponseHeaders};
use crate::registry::PendingRequest;

/// Max bytes per outbound `CHNK` body frame.
const CHUNK_SIZE: usize = 4096;

const HOP_BY_HOP: &[&str] = &["host", "content-length", "transfer-encoding"];

#[instrument(level = "debug", name = "request", skip_all, fields(request_id = %pending.meta.id))]
pub async fn replay(pending: PendingRequest, client: Client, origin: &Url, outbound: OutboundTx) {
    let id = pending.meta.id.clone();
    let url = format!("{}{}", origin_base(origin), pending.meta.url);
    let body = pending.body();

    info!(request_id = %id, method = %pending.meta.method, url = %url, "replaying request");

    let method = match pending.meta.method.parse::<reqwest::Method>() {
        Ok(m) => m,
        Err(e) => {
            emit_error_response(&outbound, &id, &format!("invalid method: {e}"));
            return;
        }
    };

    let mut builder = client.request(method, &url);
    for (key, value) in &pending.meta.headers {
        if HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(key)) {
            continue;
        }
        builder = builder.header(key, value);
    }
    builder = builder.body(body);

    let response = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(request_id = %id, error = %e, "upstream request failed");
            emit_error_response(&outbound, &id, &e.to_string());
            return;
        }
    };

    let status = response.status().as_u16();
    let headers = collect_response_headers(&response);
    send_control(
        &outbound,
        ControlMessage::Response {
            id: id.clone(),
            status,
            headers,
        },
    );

    let mut stream = response.bytes_stream();
    let mut buffer = Vec::new();
    loop {
        match stream.next().await {
            Some(Ok(bytes)) => {
                buffer.extend_from_slice(&bytes);
                while buffer.len() >= CHUNK_SIZE {
                    let rest = buffer.split_off(CHUNK_SIZE);
                    debug!(request_id = %id, bytes = CHUNK_SIZE, "streaming response chunk");
                    send_chunk(&outbound, id.clone(), std::mem::replace(&mut buffer, rest));
                }
            }
            Some(Err(e)) => {
                error!(request_id = %id, error = %e, "error reading upstream response body");
                break;
            }
            None => break,
        }
    }
    if !buffer.is_empty() {
        send_chunk(&outbound, id.clone(), buffer);
    }

    send_control(&outbound, ControlMessage::End { id });
}

/// Emits a synthesized 500 response carrying `message` as the body,
/// followed by `end`. Used both for replay failures here and for a
/// request the supervisor rejects before replay ever starts (an
/// oversized body, say).
pub(crate) fn emit_error_response(outbound: &OutboundTx, id: &str, message: &str) {
    let mut headers = ResponseHeaders::new();
    headers.insert(
        "Content-Type".to_string(),
        ResponseHeaderValue::Single("text/plain".to_string()),
    );
    send_control(
        outbound,
        ControlMessage::Response {
            id: id.to_string(),
            status: 500,
            headers,
        },
    );
    send_chunk(outbound, id.to_string(), message.as_bytes().to_vec());
    send_control(outbound, ControlMessage::End { id: id.to_string() });
}

/// Single-valued headers preserved as key→string; `Set-Cookie` collected
/// as an ordered list since it's the one header allowed to repeat.
fn collect_response_headers(response: &reqwest::Response) -> ResponseHeaders {
    let mut headers = ResponseHeaders::new();
    for (name, value) in response.headers() {
        let value = match value.to_str() {
            Ok(v) => v.to_string(),
            Err(_) => continue,
        };
        if name.as_str().eq_ignore_ascii_case("set-cookie") {
            match headers
                .entry("Set-Cookie".to_string())
                .or_insert_with(|| ResponseHeaderValue::Multi(Vec::new()))
            {
                ResponseHeaderValue::Multi(values) => values.push(value),
                ResponseHeaderValue::Single(_) => unreachable!("Set-Cookie is always Multi"),
            }
        } else {
            headers.insert(name.as_str().to_string(), ResponseHeaderValue::Single(value));
        }
    }
    headers
}

fn origin_base(origin: &Url) -> String {
    // meta.url is concatenated verbatim; trim any trailing slash so the
    // join never produces a doubled `//`.
    let s = origin.as_str();
    s.trim_end_matches('/').to_string()
}
