//! Process configuration from flags and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;

use crate::error::RouterError;

const DEFAULT_API_PORT: u16 = 5000;

#[derive(Debug, Clone, Parser)]
#[command(name = "router", about = "HTTP and TCP routing data plane")]
pub struct Config {
    /// Plain HTTP listen address.
    #[arg(long = "httpaddr", env = "HTTP_ADDR", default_value = ":8080")]
    pub http_addr: String,

    /// HTTPS listen address.
    #[arg(long = "httpsaddr", env = "HTTPS_ADDR", default_value = ":4433")]
    pub https_addr: String,

    /// Bind IP for TCP routes; empty binds all interfaces.
    #[arg(long = "tcpip", env = "LISTEN_IP", default_value = "")]
    pub tcp_ip: String,

    #[arg(long, default_value_t = 3000)]
    pub tcp_range_start: u16,

    #[arg(long, default_value_t = 3500)]
    pub tcp_range_end: u16,

    /// API listen address; defaults to `:$PORT`, or `:5000`.
    #[arg(long = "apiaddr")]
    pub api_addr: Option<String>,

    #[arg(long, env = "PORT", hide = true)]
    pub port: Option<u16>,

    /// Default TLS certificate chain: a PEM file path or PEM contents.
    #[arg(long, env = "TLSCERT", hide_env_values = true)]
    pub tls_cert: Option<String>,

    /// Default TLS private key: a PEM file path or PEM contents.
    #[arg(long, env = "TLSKEY", hide_env_values = true)]
    pub tls_key: Option<String>,

    /// Postgres route store. Routes are kept in memory when unset.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "DISCOVERD", default_value = "http://127.0.0.1:1111")]
    pub discoverd: String,

    /// Store namespace, used to prefix change notification channels.
    #[arg(long, env = "ETCD_PREFIX", default_value = "/router")]
    pub etcd_prefix: String,

    /// Base64 32-byte key for sticky session cookies.
    #[arg(long, env = "COOKIE_KEY", hide_env_values = true)]
    pub cookie_key: Option<String>,

    /// Page served with 503 responses, fetched once at startup.
    #[arg(long, env = "ERROR_503_PAGE_URL")]
    pub error_503_page_url: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn http_addr(&self) -> Result<SocketAddr, RouterError> {
        parse_addr(&self.http_addr)
    }

    pub fn https_addr(&self) -> Result<SocketAddr, RouterError> {
        parse_addr(&self.https_addr)
    }

    pub fn api_addr(&self) -> Result<SocketAddr, RouterError> {
        match &self.api_addr {
            Some(addr) => parse_addr(addr),
            None => Ok(SocketAddr::new(
                Ipv4Addr::UNSPECIFIED.into(),
                self.port.unwrap_or(DEFAULT_API_PORT),
            )),
        }
    }

    pub fn tcp_ip(&self) -> Result<IpAddr, RouterError> {
        if self.tcp_ip.is_empty() {
            return Ok(Ipv4Addr::UNSPECIFIED.into());
        }
        self.tcp_ip
            .parse()
            .map_err(|_| RouterError::Config(format!("invalid tcp ip {:?}", self.tcp_ip)))
    }
}

/// Parse `host:port`, where an empty host (`:8080`) means all interfaces.
pub fn parse_addr(addr: &str) -> Result<SocketAddr, RouterError> {
    let invalid = || RouterError::Config(format!("invalid listen address {addr:?}"));
    if let Some(port) = addr.strip_prefix(':') {
        let port = port.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port));
    }
    addr.parse().map_err(|_| invalid())
}

/// PEM given inline or as a file path.
pub fn load_pem(value: &str) -> std::io::Result<String> {
    if value.contains("-----BEGIN") {
        return Ok(value.to_string());
    }
    std::fs::read_to_string(value)
}
