// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! theory-presign
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Dev object store honoring signed URLs.
pub mod store;

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use theory_core::sha256_hex;

/// HTTP method a presigned URL is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedMethod {
    /// Download.
    Get,
    /// Upload.
    Put,
}

impl SignedMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
        }
    }
}

/// Errors from presigning.
#[derive(Debug, thiserror::Error)]
pub enum PresignError {
    /// The key escapes the bucket (absolute or traversal).
    #[error("invalid object key: {0:?}")]
    BadKey(String),
    /// System clock is before the epoch.
    #[error("system clock error")]
    Clock,
}

/// Mints presigned URLs.
///
/// The implementation signs the canonical tuple
/// `(method, bucket, key, expiry, content_type)` with a keyed SHA-256 and
/// appends the signature as query parameters. The store (dev or gateway)
/// recomputes and compares. The presigner does **not** guarantee the
/// object exists.
#[derive(Debug, Clone)]
pub struct Presigner {
    endpoint: String,
    secret: String,
}

impl Presigner {
    /// Create a presigner for `endpoint` (e.g. `http://127.0.0.1:9000`)
    /// signing with `secret`.
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    /// Presign an upload. The URL stays valid at least `ttl` and is bound
    /// to the content type when one is supplied.
    ///
    /// # Errors
    ///
    /// Returns [`PresignError::BadKey`] for keys with traversal segments.
    pub fn put_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        content_type: Option<&str>,
    ) -> Result<String, PresignError> {
        self.sign(SignedMethod::Put, bucket, key, ttl, content_type)
    }

    /// Presign a download.
    ///
    /// # Errors
    ///
    /// Returns [`PresignError::BadKey`] for keys with traversal segments.
    pub fn get_url(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, PresignError> {
        self.sign(SignedMethod::Get, bucket, key, ttl, None)
    }

    fn sign(
        &self,
        method: SignedMethod,
        bucket: &str,
        key: &str,
        ttl: Duration,
        content_type: Option<&str>,
    ) -> Result<String, PresignError> {
        let key = key.trim_start_matches('/');
        if key.is_empty() || key.split('/').any(|seg| seg == ".." || seg == ".") {
            return Err(PresignError::BadKey(key.into()));
        }
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| PresignError::Clock)?
            .as_secs()
            + ttl.as_secs();
        let sig = signature(
            &self.secret,
            method,
            bucket,
            key,
            expires,
            content_type.unwrap_or(""),
        );
        let mut url = format!(
            "{}/{bucket}/{key}?x-exp={expires}&x-sig={sig}",
            self.endpoint
        );
        if let Some(ct) = content_type {
            url.push_str("&x-ct=");
            url.push_str(&ct.replace('/', "%2F"));
        }
        Ok(url)
    }
}

/// Compute the signature over the canonical string-to-sign.
fn signature(
    secret: &str,
    method: SignedMethod,
    bucket: &str,
    key: &str,
    expires: u64,
    content_type: &str,
) -> String {
    let to_sign = format!(
        "{secret}\n{}\n{bucket}\n{key}\n{expires}\n{content_type}",
        method.as_str()
    );
    sha256_hex(to_sign.as_bytes())
}

/// Verify a signature produced by [`Presigner`]. Used by the dev store.
#[must_use]
pub fn verify_signature(
    secret: &str,
    method: SignedMethod,
    bucket: &str,
    key: &str,
    expires: u64,
    content_type: &str,
    candidate: &str,
) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(u64::MAX);
    if expires < now {
        return false;
    }
    signature(secret, method, bucket, key, expires, content_type) == candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presigner() -> Presigner {
        Presigner::new("http://127.0.0.1:9000/", "test-secret")
    }

    fn query_param<'a>(url: &'a str, name: &str) -> Option<&'a str> {
        url.split_once('?')?
            .1
            .split('&')
            .find_map(|kv| kv.strip_prefix(&format!("{name}=")))
    }

    #[test]
    fn put_url_carries_expiry_and_signature() {
        let url = presigner()
            .put_url(
                "outputs",
                "artifacts/t/e-1/outputs.json",
                Duration::from_secs(900),
                Some("application/json"),
            )
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/outputs/artifacts/t/e-1/outputs.json?"));
        let exp: u64 = query_param(&url, "x-exp").unwrap().parse().unwrap();
        let sig = query_param(&url, "x-sig").unwrap();
        assert!(verify_signature(
            "test-secret",
            SignedMethod::Put,
            "outputs",
            "artifacts/t/e-1/outputs.json",
            exp,
            "application/json",
            sig,
        ));
    }

    #[test]
    fn signature_is_method_bound() {
        let url = presigner()
            .get_url("outputs", "artifacts/t/file", Duration::from_secs(60))
            .unwrap();
        let exp: u64 = query_param(&url, "x-exp").unwrap().parse().unwrap();
        let sig = query_param(&url, "x-sig").unwrap();
        assert!(!verify_signature(
            "test-secret",
            SignedMethod::Put,
            "outputs",
            "artifacts/t/file",
            exp,
            "",
            sig,
        ));
    }

    #[test]
    fn signature_is_key_bound() {
        let url = presigner()
            .get_url("outputs", "artifacts/t/a", Duration::from_secs(60))
            .unwrap();
        let exp: u64 = query_param(&url, "x-exp").unwrap().parse().unwrap();
        let sig = query_param(&url, "x-sig").unwrap();
        assert!(!verify_signature(
            "test-secret",
            SignedMethod::Get,
            "outputs",
            "artifacts/t/b",
            exp,
            "",
            sig,
        ));
    }

    #[test]
    fn expired_signature_rejected() {
        let sig = signature(
            "test-secret",
            SignedMethod::Get,
            "outputs",
            "artifacts/t/a",
            0,
            "",
        );
        assert!(!verify_signature(
            "test-secret",
            SignedMethod::Get,
            "outputs",
            "artifacts/t/a",
            0,
            "",
            &sig,
        ));
    }

    #[test]
    fn traversal_keys_rejected() {
        assert!(matches!(
            presigner().get_url("outputs", "a/../b", Duration::from_secs(60)),
            Err(PresignError::BadKey(_))
        ));
    }

    #[test]
    fn leading_slash_stripped() {
        let url = presigner()
            .get_url("outputs", "/artifacts/t/a", Duration::from_secs(60))
            .unwrap();
        assert!(url.contains("/outputs/artifacts/t/a?"));
    }
}
