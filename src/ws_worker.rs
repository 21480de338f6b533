//! # WebSocket Proxy Worker
//!
//! Bridges one `ws-init` session to a local WebSocket dial and relays
//! frames in both directions, encoding frame bytes as base64 inside
//! `ws-frame` control messages rather than sending raw bytes over the
//! wire.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::outbound::{send_control, OutboundTx};
use crate::protocol::{ControlMessage, Headers};
use crate::registry::{Registry, WsCommand, WsHandle};

const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

/// Replaces only the scheme prefix (`http`/`https` at the very start of
/// the string) with `ws`/`wss`. A naive whole-string substring replace
/// would corrupt a path that happens to contain "http" anywhere in it.
fn derive_ws_url(origin: &Url, suffix: &str) -> Result<Url, url::ParseError> {
    let ws_scheme = match origin.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    let mut base = origin.as_str().to_string();
    if let Some(rest) = base.strip_prefix(origin.scheme()) {
        base = format!("{ws_scheme}{rest}");
    }
    let base = base.trim_end_matches('/');
    Url::parse(&format!("{base}{suffix}"))
}

#[instrument(level = "debug", name = "ws_session", skip_all, fields(request_id = %id))]
pub async fn bridge(
    id: String,
    suffix: String,
    headers: Headers,
    origin: Url,
    registry: std::sync::Arc<Registry>,
    outbound: OutboundTx,
) {
    let ws_url = match derive_ws_url(&origin, &suffix) {
        Ok(u) => u,
        Err(e) => {
            warn!(request_id = %id, error = %e, "invalid ws-init url");
            send_control(&outbound, ControlMessage::WsClose { id });
            return;
        }
    };

    let mut request = match ws_url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            warn!(request_id = %id, error = %e, "failed to build upstream ws request");
            send_control(&outbound, ControlMessage::WsClose { id });
            return;
        }
    };
    apply_headers(&mut request, &headers);

    info!(request_id = %id, url = %ws_url, "dialing upstream websocket");
    let (upstream, _response) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(request_id = %id, error = %e, "upstream websocket dial failed");
            send_control(&outbound, ControlMessage::WsClose { id });
            return;
        }
    };

    let (mut upstream_write, mut upstream_read) = upstream.split();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
    registry
        .register_ws(id.clone(), WsHandle { tx: cmd_tx })
        .await;

    loop {
        tokio::select! {
            inbound = upstream_read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let data = BASE64.encode(text.as_bytes());
                        send_control(&outbound, ControlMessage::WsFrame { id: id.clone(), data, is_binary: false });
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let data = BASE64.encode(&bytes);
                        send_control(&outbound, ControlMessage::WsFrame { id: id.clone(), data, is_binary: true });
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite internally
                    Some(Err(e)) => {
                        debug!(request_id = %id, error = %e, "upstream websocket read error");
                        break;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(WsCommand::Frame(bytes)) => {
                        if upstream_write.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(WsCommand::Close) | None => break,
                }
            }
        }
    }

    let _ = upstream_write.close().await;
    registry.take_ws(&id).await;
    send_control(&outbound, ControlMessage::WsClose { id });
}

fn apply_headers(request: &mut Request<()>, headers: &Headers) {
    let map = request.headers_mut();
    for (key, value) in headers {
        if HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(key)) {
            continue;
        }
        if let (Ok(name), Ok(val)) = (
            key.parse::<tokio_tungstenite::tungstenite::http::HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, val);
        }
    }
    // Ensure a fresh key is present even if the caller's header map
    // happened to include a stale one under a different case.
    if !map.contains_key("sec-websocket-key") {
        if let Ok(val) = HeaderValue::from_str(&generate_key()) {
            map.insert("sec-websocket-key", val);
        }
    }
}
