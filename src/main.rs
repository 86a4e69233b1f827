//! Capture proxy binary.
//!
//! ```text
//! CLI flags → config file (optional) → logging + metrics
//!     → artifact store + collaborator → dispatcher → HTTP server
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use capture_proxy::config::{load_config, validate_config, ConfigError, ProxyConfig};
use capture_proxy::lifecycle::Shutdown;
use capture_proxy::observability::{logging, metrics};
use capture_proxy::{Dispatcher, FsArtifactStore, HttpServer, LocalCollaborator};

#[derive(Parser)]
#[command(name = "capture-proxy")]
#[command(about = "HTTP forwarding proxy that records every request/response cycle", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Artifact directory, overriding `capture.directory`.
    #[arg(long)]
    capture_dir: Option<String>,
}

impl Cli {
    fn resolve_config(&self) -> Result<ProxyConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ProxyConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(dir) = &self.capture_dir {
            config.capture.directory = dir.clone();
        }
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    logging::init_logging(&config.observability);
    tracing::info!("capture-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        capture_directory = %config.capture.directory,
        idle_timeout_secs = config.timeouts.idle_secs,
        rewrite_rules = config.rewrite.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        // validated above
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        }
    }

    let store = FsArtifactStore::open(&config.capture.directory).await?;
    let collaborator = LocalCollaborator::default();
    let dispatcher = Dispatcher::new(&config, Arc::new(store), Arc::new(collaborator))?;

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    let server = HttpServer::new(config, dispatcher);
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
