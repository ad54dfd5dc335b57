//! Sticky-session cookie encryption.
//!
//! The `_backend` cookie holds `base64(nonce || tag || ciphertext)` where the
//! plaintext is the chosen backend's `host:port`, sealed as a NaCl secretbox
//! (XSalsa20-Poly1305) under a process-wide 32-byte key and a fresh 24-byte
//! nonce per cookie.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use http::header::{HeaderMap, HeaderValue, COOKIE};
use rand::RngCore;

use crate::error::RouterError;

/// Name of the sticky-session cookie.
pub const STICKY_COOKIE: &str = "_backend";

const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Process-wide sticky cookie key.
#[derive(Clone)]
pub struct CookieKey([u8; KEY_LEN]);

impl CookieKey {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self(key)
    }

    /// The all-zero key. Cookies still round-trip but can be forged.
    pub fn zero() -> Self {
        Self([0u8; KEY_LEN])
    }

    /// Decode a base64 key of exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, RouterError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| RouterError::Config(format!("invalid cookie key: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            RouterError::Config(format!(
                "invalid cookie key: expected {KEY_LEN} bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    fn cipher(&self) -> XSalsa20Poly1305 {
        XSalsa20Poly1305::new(GenericArray::from_slice(&self.0))
    }

    /// Seal `plaintext` as `nonce || tag || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let mut out = nonce.to_vec();
        // Encryption only fails on plaintexts beyond the cipher's length limit.
        if let Ok(sealed) = self.cipher().encrypt(GenericArray::from_slice(&nonce), plaintext) {
            out.extend_from_slice(&sealed);
        }
        out
    }

    /// Open a sealed buffer. Any failure yields `None`.
    pub fn decrypt(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        self.cipher().decrypt(GenericArray::from_slice(nonce), sealed).ok()
    }

    /// Backend address encoded in the request's sticky cookie, if valid.
    pub fn sticky_backend(&self, headers: &HeaderMap) -> Option<String> {
        let value = cookie_value(headers, STICKY_COOKIE)?;
        let sealed = STANDARD.decode(value).ok()?;
        let plain = self.decrypt(&sealed)?;
        String::from_utf8(plain).ok()
    }

    /// `Set-Cookie` value pinning the client to `backend`.
    pub fn sticky_cookie(&self, backend: &str) -> Option<HeaderValue> {
        let sealed = STANDARD.encode(self.encrypt(backend.as_bytes()));
        HeaderValue::from_str(&format!("{STICKY_COOKIE}={sealed}; Path=/")).ok()
    }
}

impl std::fmt::Debug for CookieKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieKey")
            .field("zero", &self.is_zero())
            .finish()
    }
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CookieKey {
        CookieKey::new([7u8; 32])
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = key();
        let sealed = key.encrypt(b"10.0.0.1:8080");
        assert_eq!(sealed.len(), NONCE_LEN + 13 + 16);
        assert_eq!(key.decrypt(&sealed).unwrap(), b"10.0.0.1:8080");
    }

    #[test]
    fn test_opens_nacl_secretbox_cookie() {
        // secretbox of "10.0.0.1:8080" under key [7; 32] and nonce [1; 24],
        // prefixed with the nonce.
        let cookie = "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBxzv5/hK38rJhxhIl0OYNrLjbbO4A8NDVDnv2FoU=";
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("_backend={cookie}")).unwrap(),
        );
        assert_eq!(key().sticky_backend(&headers).as_deref(), Some("10.0.0.1:8080"));
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let key = key();
        assert_ne!(key.encrypt(b"a:1"), key.encrypt(b"a:1"));
    }

    #[test]
    fn test_decrypt_failures_yield_none() {
        let key = key();
        assert!(key.decrypt(b"short").is_none());
        assert!(key.decrypt(&[0u8; NONCE_LEN]).is_none());

        let mut sealed = key.encrypt(b"10.0.0.1:8080");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(key.decrypt(&sealed).is_none());

        let other = CookieKey::new([8u8; 32]);
        assert!(other.decrypt(&key.encrypt(b"x:1")).is_none());
    }

    #[test]
    fn test_sticky_cookie_round_trip_through_headers() {
        let key = key();
        let set_cookie = key.sticky_cookie("127.0.0.1:9000").unwrap();
        let set_cookie = set_cookie.to_str().unwrap();
        assert!(set_cookie.starts_with("_backend="));
        assert!(set_cookie.ends_with("; Path=/"));

        let pair = set_cookie.split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&format!("a=b; {pair}")).unwrap());
        assert_eq!(key.sticky_backend(&headers).as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn test_garbage_cookie_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("_backend=!!notbase64"));
        assert!(key().sticky_backend(&headers).is_none());
    }

    #[test]
    fn test_from_base64() {
        let encoded = STANDARD.encode([1u8; 32]);
        assert!(!CookieKey::from_base64(&encoded).unwrap().is_zero());
        assert!(CookieKey::from_base64(&STANDARD.encode([1u8; 16])).is_err());
        assert!(CookieKey::from_base64("%%%").is_err());
        assert!(CookieKey::zero().is_zero());
    }
}
