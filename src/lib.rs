//! Reverse tunnel client agent. Connects outbound to a rendezvous
//! server and replays requests against a local origin, so the origin
//! never has to accept an inbound connection.

pub mod config;
pub mod error;
pub mod frame;
pub mod http_worker;
pub mod outbound;
pub mod protocol;
pub mod registry;
pub mod supervisor;
pub mod ws_worker;

pub use config::AgentConfig;
pub use error::AgentError;
pub use supervisor::Supervisor;
