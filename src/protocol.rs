//! # Control Message Protocol
//!
//! Defines the JSON control messages exchanged with the tunnel server,
//! using serde's internally-tagged representation. Several of the wire
//! types (`ws-init`, `ws-frame`, `ws-close`) are hyphenated, so each
//! variant is renamed explicitly rather than relying on `rename_all`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type Headers = HashMap<String, String>;

/// A response header value: almost always a single string, but
/// `Set-Cookie` may repeat and must survive as an ordered list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ResponseHeaderValue {
    Multi(Vec<String>),
    Single(String),
}

pub type ResponseHeaders = HashMap<String, ResponseHeaderValue>;

/// All control messages in the tunnel protocol. One enum covers both
/// inbound and outbound directions since the wire shapes for shared
/// types (`end`) are identical; each side only constructs the variants
/// it actually sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "auth")]
    Auth { token: String },

    #[serde(rename = "request")]
    Request {
        id: String,
        method: String,
        url: String,
        headers: Headers,
    },

    #[serde(rename = "end")]
    End { id: String },

    #[serde(rename = "response")]
    Response {
        id: String,
        status: u16,
        headers: ResponseHeaders,
    },

    #[serde(rename = "ws-init")]
    WsInit {
        id: String,
        url: String,
        headers: Headers,
    },

    #[serde(rename = "ws-frame")]
    WsFrame {
        id: String,
        data: String,
        #[serde(rename = "isBinary")]
        is_binary: bool,
    },

    #[serde(rename = "ws-close")]
    WsClose { id: String },
}
