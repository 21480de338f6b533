//! Classifies the error conditions the session supervisor needs to act
//! on: a bad config file is fatal before anything connects, an
//! `Unauthorized` rejection from the tunnel server is fatal after
//! connecting, and everything else is treated as a transport hiccup
//! that just triggers a reconnect.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("authentication rejected by tunnel server")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol desync: {0}")]
    ProtocolDesync(String),
}

impl AgentError {
    /// The tunnel server closes the connection with an error whose
    /// message contains "Unauthorized" when the bearer token is
    /// rejected — there's no other signal available on the wire, so
    /// this is the one case promoted to the fatal path; everything else
    /// stays a retryable transport error.
    pub fn classify_transport(err: tokio_tungstenite::tungstenite::Error) -> AgentError {
        if err.to_string().contains("Unauthorized") {
            AgentError::Unauthorized
        } else {
            AgentError::Transport(err)
        }
    }
}
