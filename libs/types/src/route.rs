//! Route definitions, normalization and validation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Certificate, RouteError};

// =============================================================================
// Route Type
// =============================================================================

/// Discriminant of a [`Route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    Http,
    Tcp,
}

impl RouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Http => "http",
            RouteType::Tcp => "tcp",
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteType {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(RouteType::Http),
            "tcp" => Ok(RouteType::Tcp),
            other => Err(RouteError::InvalidType {
                expected: "http or tcp".to_string(),
                actual: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Route
// =============================================================================

/// Highest port a TCP route may claim.
pub const MAX_TCP_PORT: i32 = 65534;

/// A routing rule from a listener-side matcher to a service.
///
/// HTTP routes use `domain`, `path`, `port` (0 means the standard listeners),
/// `sticky`, `certificate` and `disabled`. TCP routes use `port` only, where 0
/// on create asks the router to allocate one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "type")]
    pub route_type: RouteType,

    /// Server-assigned identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Opaque correlation reference supplied by the creator.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_ref: String,

    pub service: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: i32,

    /// Only route to the service leader.
    #[serde(default)]
    pub leader: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub drain_backends: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sticky: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

fn is_zero(port: &i32) -> bool {
    *port == 0
}

impl Route {
    /// New HTTP route for `domain` at the root path.
    pub fn http(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Route {
            domain: domain.into(),
            path: "/".to_string(),
            ..Route::empty(RouteType::Http, service.into())
        }
    }

    /// New TCP route on `port` (0 to allocate).
    pub fn tcp(port: i32, service: impl Into<String>) -> Self {
        Route {
            port,
            ..Route::empty(RouteType::Tcp, service.into())
        }
    }

    /// A route carrying only its type and id, as in `remove` events.
    pub fn reference(route_type: RouteType, id: impl Into<String>) -> Self {
        Route {
            id: id.into(),
            ..Route::empty(route_type, String::new())
        }
    }

    fn empty(route_type: RouteType, service: String) -> Self {
        Route {
            route_type,
            id: String::new(),
            parent_ref: String::new(),
            service,
            port: 0,
            leader: false,
            drain_backends: false,
            created_at: None,
            updated_at: None,
            domain: String::new(),
            certificate: None,
            sticky: false,
            path: String::new(),
            disabled: false,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Identifier in `{type}/{id}` form.
    pub fn formatted_id(&self) -> String {
        format!("{}/{}", self.route_type, self.id)
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Canonicalize the fields lookups depend on.
    pub fn normalize(&mut self) {
        self.service = self.service.trim().to_string();
        if self.route_type == RouteType::Http {
            self.domain = self.domain.trim().to_ascii_lowercase();
            self.path = normalize_path(&self.path);
        }
    }

    /// Check a normalized route.
    pub fn validate(&self) -> Result<(), RouteError> {
        if self.service.is_empty() {
            return Err(RouteError::InvalidService);
        }
        match self.route_type {
            RouteType::Http => {
                validate_domain(&self.domain)?;
                if !is_valid_path(&self.path) {
                    return Err(RouteError::InvalidPath(self.path.clone()));
                }
                if !(0..=65535).contains(&self.port) {
                    return Err(RouteError::InvalidPort(self.port));
                }
            }
            RouteType::Tcp => {
                if !(0..=MAX_TCP_PORT).contains(&self.port) {
                    return Err(RouteError::InvalidPort(self.port));
                }
            }
        }
        Ok(())
    }

    /// Fail unless the route has the expected type.
    pub fn expect_type(&self, expected: RouteType) -> Result<(), RouteError> {
        if self.route_type != expected {
            return Err(RouteError::InvalidType {
                expected: expected.to_string(),
                actual: self.route_type.to_string(),
            });
        }
        Ok(())
    }

    /// Copy of the route with any certificate key removed.
    pub fn without_key(&self) -> Self {
        Route {
            certificate: self.certificate.as_ref().map(Certificate::without_key),
            ..self.clone()
        }
    }
}

// =============================================================================
// Normalization helpers
// =============================================================================

/// Trim trailing whitespace, default to `/`, and terminate with `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end();
    if trimmed.is_empty() {
        return "/".to_string();
    }
    let mut path = trimmed.to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

/// Whether `path` matches `^/(.*/)?$`.
pub fn is_valid_path(path: &str) -> bool {
    path.starts_with('/') && path.ends_with('/') && !path.contains('\n')
}

fn validate_domain(domain: &str) -> Result<(), RouteError> {
    let invalid = domain.is_empty()
        || domain.contains(|c: char| c.is_whitespace() || c == '/' || c == ':')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || domain.chars().skip(1).any(|c| c == '*')
        || (domain.starts_with('*') && !domain.starts_with("*."));
    if invalid {
        return Err(RouteError::InvalidDomain(domain.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_route_type_serialization() {
        assert_eq!(serde_json::to_string(&RouteType::Http).unwrap(), "\"http\"");
        assert_eq!("tcp".parse::<RouteType>().unwrap(), RouteType::Tcp);
        assert!("udp".parse::<RouteType>().is_err());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("   "), "/");
        assert_eq!(normalize_path("/foo"), "/foo/");
        assert_eq!(normalize_path("/foo/ \t"), "/foo/");
        assert_eq!(normalize_path("/foo/bar/"), "/foo/bar/");
    }

    #[test]
    fn test_is_valid_path() {
        assert!(is_valid_path("/"));
        assert!(is_valid_path("/a/b/"));
        assert!(!is_valid_path("a/"));
        assert!(!is_valid_path("/a"));
        assert!(!is_valid_path("/a\n/"));
    }

    #[test]
    fn test_http_route_normalize_and_validate() {
        let mut route = Route::http("Example.COM ", "web").with_path("/api");
        route.normalize();
        assert_eq!(route.domain, "example.com");
        assert_eq!(route.path, "/api/");
        route.validate().unwrap();

        let mut wildcard = Route::http("*.a.example", "web");
        wildcard.normalize();
        wildcard.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_routes() {
        let mut route = Route::http("example.com", "");
        route.normalize();
        assert_eq!(route.validate(), Err(RouteError::InvalidService));

        let route = Route::http("", "web");
        assert!(matches!(route.validate(), Err(RouteError::InvalidDomain(_))));

        let route = Route::http("a.*.example", "web");
        assert!(matches!(route.validate(), Err(RouteError::InvalidDomain(_))));

        let route = Route::http("example.com", "web").with_path("nope/");
        assert!(matches!(route.validate(), Err(RouteError::InvalidPath(_))));

        let route = Route::tcp(65535, "db");
        assert_eq!(route.validate(), Err(RouteError::InvalidPort(65535)));

        Route::tcp(0, "db").validate().unwrap();
    }

    #[test]
    fn test_route_wire_format() {
        let mut route = Route::tcp(3000, "db");
        route.id = "abc".to_string();
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["type"], "tcp");
        assert_eq!(json["port"], 3000);
        assert_eq!(json["service"], "db");
        assert!(json.get("domain").is_none());
        assert_eq!(route.formatted_id(), "tcp/abc");

        let parsed: Route =
            serde_json::from_str(r#"{"type":"http","service":"web","domain":"a.example"}"#)
                .unwrap();
        assert_eq!(parsed.route_type, RouteType::Http);
        assert_eq!(parsed.port, 0);
        assert!(!parsed.sticky);
    }

    #[test]
    fn test_without_key_strips_certificate_key() {
        let mut route = Route::http("a.example", "web");
        route.certificate = Some(Certificate {
            key: "secret".to_string(),
            key_id: "kid".to_string(),
            ..Default::default()
        });
        let stripped = route.without_key();
        let cert = stripped.certificate.unwrap();
        assert!(cert.key.is_empty());
        assert_eq!(cert.key_id, "kid");
    }

    proptest! {
        #[test]
        fn normalized_paths_are_valid(path in "/[a-z0-9/._-]{0,24}[ \t]{0,3}") {
            let normalized = normalize_path(&path);
            prop_assert!(is_valid_path(&normalized));
            prop_assert_eq!(normalize_path(&normalized), normalized.clone());
        }
    }
}
