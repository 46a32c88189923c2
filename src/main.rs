//! Strata Uploadr - direct-to-cloud resumable upload client
//!
//! Streams a local file to whichever storage residency the authorization
//! service selects, using pre-signed requests only.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use strata_uploadr::api::{AuthorizationClient, FileParams};
use strata_uploadr::config::Config;
use strata_uploadr::hash::Md5HashService;
use strata_uploadr::session::{ProfileRegistry, SessionState, UploadDescriptor, UploadSession};
use strata_uploadr::transport::HttpTransport;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Strata Uploadr - resumable direct-to-cloud uploads
#[derive(Parser, Debug)]
#[command(name = "strata-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// File to upload
    file: PathBuf,

    /// Remote sub-path under the bucket
    #[arg(long)]
    remote_path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Strata Uploadr v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config)?;
    info!("Loaded configuration from {:?}", args.config);

    let metadata = tokio::fs::metadata(&args.file).await?;
    let file_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", args.file.display()))?;

    let http = reqwest::Client::new();
    let file = FileParams {
        file_name: file_name.clone(),
        file_size: metadata.len(),
        file_id: None,
        file_path: args.remote_path.clone(),
        parameters: None,
    };

    let residence = AuthorizationClient::check_provider(&http, &config.endpoint, &file).await?;
    let profile = ProfileRegistry::default()
        .get(&residence)
        .ok_or_else(|| anyhow::anyhow!("service answered with unknown residence {residence}"))?;
    info!(%residence, size = metadata.len(), "Upload accepted for negotiation");

    let session = UploadSession::new(
        AuthorizationClient::new(http.clone(), &config.endpoint, file),
        Arc::new(HttpTransport::new(http)),
        Arc::new(Md5HashService),
        profile,
        UploadDescriptor {
            file_name,
            file_size: metadata.len(),
            file_path: args.remote_path,
            source: args.file.clone(),
        },
    );

    let state = session.start().await?;
    match state {
        SessionState::Completed => {
            info!(file = %args.file.display(), "Upload completed");
            Ok(())
        }
        other => {
            let reason = session.reason().unwrap_or_else(|| "unknown".to_string());
            anyhow::bail!("upload stopped in state {other}: {reason}")
        }
    }
}
