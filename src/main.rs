use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use vertex_gateway::credentials::TokenSourceConfig;

fn env_u64(name: &str) -> anyhow::Result<Option<u64>> {
    let Some(raw) = env_string(name) else {
        return Ok(None);
    };
    raw.parse::<u64>()
        .map(Some)
        .map_err(|e| anyhow::anyhow!("invalid integer value for {name}: {raw:?}: {e}"))
}

fn env_f64(name: &str) -> anyhow::Result<Option<f64>> {
    let Some(raw) = env_string(name) else {
        return Ok(None);
    };
    raw.parse::<f64>()
        .map(Some)
        .map_err(|e| anyhow::anyhow!("invalid number value for {name}: {raw:?}: {e}"))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn token_source_from_env() -> TokenSourceConfig {
    if let Some(token) = env_string("VERTEX_ACCESS_TOKEN") {
        return TokenSourceConfig::Static(token);
    }
    if let Some(path) = env_string("GOOGLE_APPLICATION_CREDENTIALS") {
        return TokenSourceConfig::CredentialsFile(PathBuf::from(path));
    }
    TokenSourceConfig::MetadataServer
}

fn config_from_env() -> anyhow::Result<vertex_gateway::AppConfig> {
    let mut cfg = vertex_gateway::AppConfig::default();

    if let Some(project_id) = env_string("VERTEX_PROJECT_ID") {
        cfg.project_id = project_id;
    }
    cfg.model_pools_file = env_string("MODEL_POOLS_FILE").map(PathBuf::from);

    if let Some(value) = env_u64("MAX_REQUEST_BYTES")? {
        cfg.max_request_bytes = usize::try_from(value)?;
    }
    if let Some(ms) = env_u64("UPSTREAM_CONNECT_TIMEOUT_MS")? {
        cfg.upstream_connect_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = env_u64("UPSTREAM_TIMEOUT_SECS")? {
        cfg.upstream_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = env_u64("UPSTREAM_FIRST_BYTE_TIMEOUT_SECS")? {
        cfg.upstream_first_byte_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = env_u64("TOKEN_TTL_SECS")? {
        cfg.token_ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = env_u64("TOKEN_FETCH_TIMEOUT_SECS")? {
        cfg.token_fetch_timeout = Duration::from_secs(secs);
    }

    if let Some(value) = env_u64("MAX_RETRIES")? {
        cfg.retry.max_retries = u32::try_from(value)?;
    }
    if let Some(value) = env_f64("RETRY_BASE_DELAY_SECS")? {
        cfg.retry.base_delay_secs = value;
    }
    if let Some(value) = env_f64("RETRY_MULTIPLIER")? {
        cfg.retry.multiplier = value;
    }
    if let Some(value) = env_f64("RETRY_MAX_DELAY_SECS")? {
        cfg.retry.max_delay_secs = value;
    }
    if let Some(value) = env_f64("RETRY_JITTER_FACTOR")? {
        cfg.retry.jitter_factor = value;
    }

    cfg.token_source = token_source_from_env();
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listen: SocketAddr = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:4000".to_string())
        .parse()?;

    let cfg = config_from_env()?;
    let routing = vertex_gateway::RoutingTable::load(&cfg)?;
    let identity_client = reqwest::Client::builder()
        .connect_timeout(cfg.upstream_connect_timeout)
        .timeout(cfg.token_fetch_timeout)
        .build()?;
    let token_source = cfg.token_source.build(identity_client).await?;
    tracing::info!(
        project_id = %cfg.project_id,
        models = routing.pools.len(),
        token_source = token_source.describe(),
        max_retries = cfg.retry.max_retries,
        "routing table loaded"
    );

    let state = vertex_gateway::AppState::new(cfg, routing, token_source);
    let app = vertex_gateway::app(state);

    let listener = TcpListener::bind(listen).await?;
    tracing::info!(%listen, "listening");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
