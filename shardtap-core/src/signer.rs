//! Signature version 2 request signing.
//!
//! The canonical document is
//!
//! ```text
//! <METHOD>\n<lowercased host>\n/\n<sorted, percent-encoded key=value pairs joined by &>
//! ```
//!
//! and the signature is the base64 encoding of its HMAC-SHA1 under the
//! caller's secret key. Every call builds its own HMAC context, so a single
//! signer can be shared freely between tasks.

use crate::{Result, TapError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::BTreeMap;
use std::fmt;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_METHOD: &str = "HmacSHA1";
pub const SIGNATURE_VERSION: &str = "2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }

    /// Requests without a body can be replayed safely.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::Get)
    }
}

#[derive(Clone)]
pub struct RequestSigner {
    secret: Vec<u8>,
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner").finish_non_exhaustive()
    }
}

impl RequestSigner {
    pub fn new(secret_access_key: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret_access_key.as_ref().to_vec(),
        }
    }

    pub fn sign(
        &self,
        method: HttpMethod,
        host: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String> {
        let document = canonical_document(method, host, params);

        let mut mac = HmacSha1::new_from_slice(&self.secret)
            .map_err(|error| TapError::Internal(format!("invalid signing key: {}", error)))?;
        mac.update(document.as_bytes());

        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

pub fn canonical_document(
    method: HttpMethod,
    host: &str,
    params: &BTreeMap<String, String>,
) -> String {
    let query = encode_params(params);
    let mut document = String::with_capacity(query.len() + host.len() + 16);
    document.push_str(method.as_str());
    document.push('\n');
    document.push_str(&host.to_ascii_lowercase());
    document.push_str("\n/\n");
    document.push_str(&query);
    document
}

/// `key=value` pairs joined by `&`, in key order. Used for the signed
/// document, GET query strings, and POST bodies alike.
pub fn encode_params(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn encode_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}
