use tracing_subscriber::{EnvFilter, fmt};
use tracing::info;

use quillhub::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env();
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "quillhub",
        "quillhub starting: RUST_LOG='{}', http_port={}, upload_dir='{}', image_host='{}'",
        rust_log, config.http_port, config.upload_dir.display(), config.image_host_url
    );
    tracing::debug!(target: "quillhub", "config: {:?}", config);

    quillhub::server::run(config).await
}
