use clap::Parser;
use tracing::error;

use tunnel_agent::{AgentConfig, AgentError, Supervisor};

#[derive(Parser, Debug)]
#[command(author, version, about = "Reverse tunnel client agent")]
struct Cli {
    /// Path to the JSON config file (token, host, tunnel authority).
    #[arg(short, long, default_value = "config.json")]
    config: std::path::PathBuf,

    /// Raise log verbosity to debug (overridden by RUST_LOG if set).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let config = match AgentConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let supervisor = Supervisor::new(config);
    match supervisor.run().await {
        AgentError::Unauthorized => {
            error!("fatal: {}", AgentError::Unauthorized);
            std::process::exit(2);
        }
        other => {
            error!("fatal: {other}");
            std::process::exit(1);
        }
    }
}
