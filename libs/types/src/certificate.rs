//! TLS certificates attached to HTTP routes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::RouteError;

/// A PEM certificate chain and its private key.
///
/// The certificate `id` is the base64url SHA-256 fingerprint of the DER chain,
/// so two uploads of the same chain collapse into one record. The private key
/// is never serialized; stores hand it out separately through `key_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// SHA-256 fingerprint of the DER chain (base64url).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Ids of the routes using this certificate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,

    /// PEM-encoded certificate chain, leaf first.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chain: String,

    /// PEM-encoded private key. Accepted on input, never written out.
    #[serde(default, skip_serializing)]
    pub key: String,

    /// SHA-256 of the DER private key (base64url).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Certificate {
    /// Build a certificate from PEM chain and key, computing its ids.
    pub fn from_pem(chain: impl Into<String>, key: impl Into<String>) -> Result<Self, RouteError> {
        let mut cert = Certificate {
            chain: chain.into(),
            key: key.into(),
            ..Default::default()
        };
        cert.normalize()?;
        Ok(cert)
    }

    /// Recompute `id` from the chain and, when a key is present, `key_id`.
    pub fn normalize(&mut self) -> Result<(), RouteError> {
        self.id = fingerprint(&self.chain_der()?);
        if !self.key.is_empty() {
            self.key_id = key_fingerprint(&self.key_der()?);
        }
        Ok(())
    }

    /// DER blocks of the chain, in order.
    pub fn chain_der(&self) -> Result<Vec<Vec<u8>>, RouteError> {
        let chain = rustls_pemfile::certs(&mut self.chain.as_bytes())
            .map(|der| der.map(|der| der.as_ref().to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RouteError::InvalidCertificate(e.to_string()))?;
        if chain.is_empty() {
            return Err(RouteError::InvalidCertificate(
                "missing CERTIFICATE block in PEM input".to_string(),
            ));
        }
        Ok(chain)
    }

    /// DER bytes of the private key.
    pub fn key_der(&self) -> Result<Vec<u8>, RouteError> {
        match rustls_pemfile::private_key(&mut self.key.as_bytes()) {
            Ok(Some(key)) => Ok(key.secret_der().to_vec()),
            Ok(None) => Err(RouteError::InvalidCertificate(
                "missing PRIVATE KEY block in PEM input".to_string(),
            )),
            Err(e) => Err(RouteError::InvalidCertificate(e.to_string())),
        }
    }

    /// Copy of this certificate without the private key.
    pub fn without_key(&self) -> Self {
        Certificate {
            key: String::new(),
            ..self.clone()
        }
    }
}

/// Fingerprint of a DER chain.
pub fn fingerprint(chain: &[Vec<u8>]) -> String {
    let mut hasher = Sha256::new();
    for der in chain {
        hasher.update(der);
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn key_fingerprint(der: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(der))
}
