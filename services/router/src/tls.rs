//! TLS termination: SNI certificate selection for the HTTPS listener.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use gatehouse_types::Certificate;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::debug;

use crate::error::RouterError;

/// Wildcard names that may serve `host`, most specific first.
///
/// `x.a.example` yields `*.x.a.example`, `*.a.example`, `*.example`. Only
/// the first five labels are split, so very deep names match at most five
/// wildcard levels.
pub fn wildcard_candidates(host: &str) -> impl Iterator<Item = String> + '_ {
    let labels: Vec<&str> = host.splitn(5, '.').collect();
    (0..labels.len()).map(move |i| format!("*.{}", labels[i..].join(".")))
}

/// Parse a PEM chain and key into a rustls signing identity.
pub fn certified_key(chain: &str, key: &str) -> Result<Arc<CertifiedKey>, RouterError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut chain.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| RouterError::Tls(format!("invalid certificate chain: {e}")))?;
    if certs.is_empty() {
        return Err(RouterError::Tls("empty certificate chain".to_string()));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key.as_bytes())
        .map_err(|e| RouterError::Tls(format!("invalid private key: {e}")))?
        .ok_or_else(|| RouterError::Tls("no private key found".to_string()))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Signing identity for a route certificate.
pub fn route_certified_key(cert: &Certificate) -> Result<Arc<CertifiedKey>, RouterError> {
    if cert.key.is_empty() {
        return Err(RouterError::Tls(format!(
            "certificate {} has no private key",
            cert.id
        )));
    }
    certified_key(&cert.chain, &cert.key)
}

/// SNI certificate map shared between the HTTPS acceptor and the route table.
///
/// Lookup order: exact name, most specific wildcard, then the default
/// certificate. With no match the handshake fails.
#[derive(Debug, Default)]
pub struct CertResolver {
    names: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    default: Option<Arc<CertifiedKey>>,
}

impl CertResolver {
    pub fn new(default: Option<Arc<CertifiedKey>>) -> Self {
        Self {
            names: RwLock::new(HashMap::new()),
            default,
        }
    }

    /// Serve `key` for `name` (an exact domain or a `*.` wildcard).
    pub fn insert(&self, name: &str, key: Arc<CertifiedKey>) {
        self.names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_ascii_lowercase(), key);
    }

    pub fn remove(&self, name: &str) {
        self.names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.to_ascii_lowercase());
    }

    pub fn len(&self) -> usize {
        self.names.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Certificate for a server name, falling back to the default.
    pub fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = server_name {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            let names = self.names.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(key) = names.get(&name) {
                return Some(Arc::clone(key));
            }
            let wildcard = wildcard_candidates(&name).find_map(|w| names.get(&w).cloned());
            if wildcard.is_some() {
                return wildcard;
            }
        }
        self.default.clone()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name();
        let key = self.lookup(name);
        if key.is_none() {
            debug!(server_name = ?name, "no certificate for server name");
        }
        key
    }
}

/// Server config for the HTTPS listener, resolving certificates by SNI.
pub fn server_config(resolver: Arc<CertResolver>) -> Result<Arc<ServerConfig>, RouterError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_for(name: &str) -> Arc<CertifiedKey> {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        certified_key(&cert.cert.pem(), &cert.key_pair.serialize_pem()).unwrap()
    }

    #[test]
    fn test_wildcard_candidates() {
        let candidates: Vec<String> = wildcard_candidates("x.a.example").collect();
        assert_eq!(candidates, vec!["*.x.a.example", "*.a.example", "*.example"]);

        let deep: Vec<String> = wildcard_candidates("a.b.c.d.e.f").collect();
        assert_eq!(deep.len(), 5);
        assert_eq!(deep[4], "*.e.f");
    }

    #[test]
    fn test_lookup_order() {
        let exact = key_for("x.a.example");
        let wildcard = key_for("*.a.example");
        let fallback = key_for("default.example");

        let resolver = CertResolver::new(Some(fallback.clone()));
        resolver.insert("x.a.example", exact.clone());
        resolver.insert("*.a.example", wildcard.clone());

        assert!(Arc::ptr_eq(&resolver.lookup(Some("X.A.example")).unwrap(), &exact));
        assert!(Arc::ptr_eq(&resolver.lookup(Some("y.a.example")).unwrap(), &wildcard));
        assert!(Arc::ptr_eq(&resolver.lookup(Some("z.y.a.example")).unwrap(), &wildcard));
        assert!(Arc::ptr_eq(&resolver.lookup(Some("b.example")).unwrap(), &fallback));
        assert!(Arc::ptr_eq(&resolver.lookup(None).unwrap(), &fallback));

        resolver.remove("*.a.example");
        assert!(Arc::ptr_eq(&resolver.lookup(Some("y.a.example")).unwrap(), &fallback));
    }

    #[test]
    fn test_no_match_without_default() {
        let resolver = CertResolver::new(None);
        resolver.insert("*.a.example", key_for("*.a.example"));
        assert!(resolver.lookup(Some("y.b.example")).is_none());
        assert!(resolver.lookup(None).is_none());
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_rejects_bad_pem() {
        assert!(matches!(certified_key("nope", "nope"), Err(RouterError::Tls(_))));
        let cert = rcgen::generate_simple_self_signed(vec!["a.example".to_string()]).unwrap();
        assert!(matches!(
            certified_key(&cert.cert.pem(), ""),
            Err(RouterError::Tls(_))
        ));
    }
}
