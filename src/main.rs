use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use confide::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    // Resolve configuration once; components receive the struct, nothing
    // reads the environment after this point.
    let cfg = ServerConfig::from_env()?;

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "confide",
        "confide starting: RUST_LOG='{}', http_port={}, scheme={}, db_root='{}'",
        rust_log, cfg.http_port, cfg.scheme.as_str(), cfg.db_root
    );

    confide::server::run(cfg).await
}
