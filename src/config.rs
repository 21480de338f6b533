//! # Configuration Loader
//!
//! Loads the token, local origin, and tunnel server authority from a
//! JSON file at startup, with environment variables able to override
//! whatever the file says.

use crate::error::AgentError;
use serde::Deserialize;
use std::path::Path;
use url::Url;

/// Fixed path segment embedded in the agent, joined with the configured
/// tunnel authority to form the full `wss://` endpoint.
const TUNNEL_PATH: &str = "c97ad31f9fc13ff4e6bd022e74dd561ce93cf67e624dc061d461c1226e70";

/// Per-request body and per-session parser buffer ceilings. 64 MiB
/// comfortably covers file uploads without leaving the process open to
/// unbounded memory growth from a hostile or buggy tunnel server.
const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_FRAME_BUFFER_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct RawConfig {
    token: String,
    host: String,
    tunnel: String,
    #[serde(default)]
    max_body_bytes: Option<usize>,
    #[serde(default)]
    max_frame_buffer_bytes: Option<usize>,
}

/// Fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub token: String,
    pub host: Url,
    pub tunnel_url: Url,
    pub max_body_bytes: usize,
    pub max_frame_buffer_bytes: usize,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<AgentConfig, AgentError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("reading {}: {e}", path.display())))?;
        let mut raw: RawConfig = serde_json::from_str(&text)
            .map_err(|e| AgentError::Config(format!("parsing {}: {e}", path.display())))?;

        if let Ok(token) = std::env::var("TUNNEL_TOKEN") {
            raw.token = token;
        }
        if let Ok(host) = std::env::var("TUNNEL_HOST") {
            raw.host = host;
        }
        if let Ok(tunnel) = std::env::var("TUNNEL_SERVER") {
            raw.tunnel = tunnel;
        }

        if raw.token.is_empty() {
            return Err(AgentError::Config("token must not be empty".into()));
        }

        let host = Url::parse(&raw.host)
            .map_err(|e| AgentError::Config(format!("invalid host url {:?}: {e}", raw.host)))?;
        match host.scheme() {
            "http" | "https" => {}
            other => {
                return Err(AgentError::Config(format!(
                    "host scheme must be http or https, got {other:?}"
                )))
            }
        }

        if raw.tunnel.is_empty() {
            return Err(AgentError::Config("tunnel authority must not be empty".into()));
        }
        let tunnel_url = Url::parse(&format!("wss://{}/{TUNNEL_PATH}", raw.tunnel))
            .map_err(|e| AgentError::Config(format!("invalid tunnel authority: {e}")))?;

        Ok(AgentConfig {
            token: raw.token,
            host,
            tunnel_url,
            max_body_bytes: raw.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            max_frame_buffer_bytes: raw
                .max_frame_buffer_bytes
                .unwrap_or(DEFAULT_MAX_FRAME_BUFFER_BYTES),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_valid_config() {
        let cfg = write_config(
            r#"{"token":"abc","host":"http://127.0.0.1:8080","tunnel":"relay.example.com"}"#,
        );
        let parsed = AgentConfig::load(cfg.path()).unwrap();
        assert_eq!(parsed.token, "abc");
        assert_eq!(parsed.host.as_str(), "http://127.0.0.1:8080/");
        assert_eq!(
            parsed.tunnel_url.as_str(),
            "wss://relay.example.com/c97ad31f9fc13ff4e6bd022e74dd561ce93cf67e624dc061d461c1226e70"
        );
    }

    #[test]
    fn rejects_non_http_scheme() {
        let cfg = write_config(
            r#"{"token":"abc","host":"ftp://127.0.0.1:8080","tunnel":"relay.example.com"}"#,
        );
        assert!(AgentConfig::load(cfg.path()).is_err());
    }

    #[test]
    fn rejects_empty_token() {
        let cfg = write_config(
            r#"{"token":"","host":"http://127.0.0.1:8080","tunnel":"relay.example.com"}"#,
        );
        assert!(AgentConfig::load(cfg.path()).is_err());
    }

    #[test]
    fn env_overrides_win_over_file() {
        std::env::set_var("TUNNEL_TOKEN", "from-env");
        let cfg = write_config(
            r#"{"token":"from-file","host":"http://127.0.0.1:8080","tunnel":"relay.example.com"}"#,
        );
        let parsed = AgentConfig::load(cfg.path()).unwrap();
        std::env::remove_var("TUNNEL_TOKEN");
        assert_eq!(parsed.token, "from-env");
    }
}
