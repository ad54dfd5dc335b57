//! Route validation errors.

use thiserror::Error;

/// Reasons a route is rejected before it reaches the routing table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The service name is empty.
    #[error("invalid service: service name must not be empty")]
    InvalidService,

    /// The domain is empty or malformed.
    #[error("invalid domain: {0:?}")]
    InvalidDomain(String),

    /// The path does not match `^/(.*/)?$`.
    #[error("invalid path: {0:?} (must start and end with '/')")]
    InvalidPath(String),

    /// The port is outside the range allowed for the route type.
    #[error("invalid port: {0}")]
    InvalidPort(i32),

    /// A non-root path was added without a root route for its domain and port.
    #[error("missing root route for {domain}:{port}, add a \"/\" route first")]
    MissingRootRoute { domain: String, port: i32 },

    /// The root route still has non-root siblings.
    #[error("root route for {domain}:{port} is still used by other paths")]
    RootRouteInUse { domain: String, port: i32 },

    /// Routes for the same service disagree on `drain_backends`.
    #[error("drain_backends mismatch for service {0:?}")]
    DrainMismatch(String),

    /// The route has the wrong type for the operation.
    #[error("invalid route type: expected {expected}, got {actual}")]
    InvalidType { expected: String, actual: String },

    /// The certificate chain or key cannot be parsed.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The store rejected the route with a constraint message.
    #[error("route rejected: {0}")]
    Rejected(String),
}
