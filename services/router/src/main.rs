//! gatehouse router
//!
//! HTTP/HTTPS and TCP routing data plane. Routes come from a route store
//! (Postgres, or in memory for development) and backends from discoverd.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use gatehouse_router::{
    api,
    config::{self, Config},
    cookie::CookieKey,
    discovery::DiscoverdClient,
    proxy::ErrorPage,
    store::{MemoryStore, PostgresStore, RouteStore},
    tls, Gateway, HttpConfig, TcpConfig,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MAX_ERROR_PAGE_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gatehouse router");

    let cookie_key = match config.cookie_key.as_deref() {
        Some(encoded) => CookieKey::from_base64(encoded).context("invalid COOKIE_KEY")?,
        None => {
            warn!("COOKIE_KEY not set, sticky session cookies use an all-zero key");
            CookieKey::zero()
        }
    };

    let error_page = match config.error_503_page_url.as_deref() {
        Some(url) => ErrorPage::new(Some(fetch_error_page(url).await?)),
        None => ErrorPage::default(),
    };

    let default_cert = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (Some(cert), Some(key)) => {
            let cert = config::load_pem(cert).context("failed to read TLS certificate")?;
            let key = config::load_pem(key).context("failed to read TLS key")?;
            Some(tls::certified_key(&cert, &key).context("invalid default TLS keypair")?)
        }
        (None, None) => None,
        _ => bail!("--tls-cert and --tls-key must be set together"),
    };

    let store: Arc<dyn RouteStore> = match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresStore::connect(url, &config.etcd_prefix)
                .await
                .context("failed to connect to route database")?;
            store.ping().await.context("route database unavailable")?;
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, using an in-memory route store");
            Arc::new(MemoryStore::new())
        }
    };

    let discovery =
        Arc::new(DiscoverdClient::new(config.discoverd.clone()).context("discoverd client")?);

    let http = HttpConfig {
        addr: config.http_addr()?,
        tls_addr: config.https_addr()?,
        default_cert,
        cookie_key,
        error_page,
    };
    let tcp = TcpConfig {
        ip: config.tcp_ip()?,
        port_start: config.tcp_range_start,
        port_end: config.tcp_range_end,
    };
    info!(
        http_addr = %http.addr,
        https_addr = %http.tls_addr,
        tcp_ip = %tcp.ip,
        tcp_range_start = tcp.port_start,
        tcp_range_end = tcp.port_end,
        discoverd = %config.discoverd,
        "Configuration loaded"
    );

    let gateway = Gateway::new(http, tcp, store, discovery);
    gateway.start().await.context("failed to start listeners")?;

    let api_addr = config.api_addr()?;
    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind API address {api_addr}"))?;
    info!(addr = %api_addr, "API listening");

    let app = api::create_router(gateway.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        })
        .await;

    gateway.close();
    served.context("API server failed")?;
    info!("Router shutdown complete");
    Ok(())
}

/// Fetch the custom 503 page.
async fn fetch_error_page(url: &str) -> Result<Bytes> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("failed to fetch error page {url}"))?;
    if response.status() != reqwest::StatusCode::OK {
        bail!("error page {url} returned {}", response.status());
    }
    if response
        .content_length()
        .is_some_and(|len| len > MAX_ERROR_PAGE_BYTES as u64)
    {
        bail!("error page {url} exceeds {MAX_ERROR_PAGE_BYTES} bytes");
    }
    let body = response.bytes().await.context("failed to read error page")?;
    if body.len() > MAX_ERROR_PAGE_BYTES {
        bail!("error page {url} exceeds {MAX_ERROR_PAGE_BYTES} bytes");
    }
    Ok(body)
}
