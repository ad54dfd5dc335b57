//! Router error taxonomy.

use gatehouse_types::RouteError;
use thiserror::Error;

/// Errors surfaced by listeners, stores, discovery and the transport.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The route failed validation. No state was mutated.
    #[error(transparent)]
    Validation(#[from] RouteError),

    /// No route (or key) with the given id.
    #[error("not found")]
    NotFound,

    /// A uniqueness constraint was violated (domain/port/path, TCP port, cert).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The listener or store has been closed.
    #[error("closed")]
    Closed,

    /// The reserved TCP port pool is exhausted.
    #[error("no ports available")]
    NoPorts,

    /// Every backend failed to dial, or the service has none.
    #[error("no backends available")]
    NoBackends,

    /// The route store failed or its stream ended.
    #[error("store error: {0}")]
    Store(String),

    /// A watcher fell behind the store's retained history and must re-list.
    #[error("watch stream too old, full resync required")]
    TooOld,

    /// The discovery subscription failed.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Invalid process configuration (keys, addresses).
    #[error("config error: {0}")]
    Config(String),

    /// TLS configuration or certificate error.
    #[error("tls error: {0}")]
    Tls(String),

    /// Backend traffic failed after a successful dial.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// Errors that concern one route only and must not end a sync loop.
    pub fn is_route_scoped(&self) -> bool {
        matches!(
            self,
            RouterError::Validation(_)
                | RouterError::Conflict(_)
                | RouterError::Discovery(_)
                | RouterError::Tls(_)
                | RouterError::Io(_)
        )
    }
}

impl From<sqlx::Error> for RouterError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RouterError::NotFound,
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("23505") => RouterError::Conflict(db.message().to_string()),
                Some("P0001") => {
                    RouterError::Validation(RouteError::Rejected(db.message().to_string()))
                }
                _ => RouterError::Store(db.to_string()),
            },
            other => RouterError::Store(other.to_string()),
        }
    }
}

impl From<rustls::Error> for RouterError {
    fn from(err: rustls::Error) -> Self {
        RouterError::Tls(err.to_string())
    }
}

impl From<hyper::Error> for RouterError {
    fn from(err: hyper::Error) -> Self {
        RouterError::Upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_scoped_errors() {
        assert!(RouterError::Validation(RouteError::InvalidService).is_route_scoped());
        assert!(RouterError::Tls("bad".into()).is_route_scoped());
        assert!(!RouterError::Store("gone".into()).is_route_scoped());
        assert!(!RouterError::TooOld.is_route_scoped());
        assert!(!RouterError::Closed.is_route_scoped());
    }

    #[test]
    fn test_display() {
        assert_eq!(RouterError::NoPorts.to_string(), "no ports available");
        assert_eq!(
            RouterError::Validation(RouteError::InvalidPort(0)).to_string(),
            "invalid port: 0"
        );
    }
}
