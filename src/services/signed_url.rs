//! Signed-URL issuance and validation.
//!
//! Every non-public byte read passes through this gate. A grant is never
//! persisted; it is an HMAC-SHA256 over `objectKey:expiresMillis:purpose`
//! rendered as hex and embedded in the URL's query string. Validation is a
//! pure synchronous check: expiry first, then a constant-time signature
//! comparison.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignedUrlError {
    #[error("signed URL has expired")]
    Expired,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unknown purpose `{0}`")]
    InvalidPurpose(String),
    #[error("malformed expires parameter")]
    MalformedExpiry,
}

/// What the grant authorizes; determines the response cache ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Download,
    Preview,
    Stream,
    Transform,
}

impl Purpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::Download => "download",
            Purpose::Preview => "preview",
            Purpose::Stream => "stream",
            Purpose::Transform => "transform",
        }
    }

    /// Maximum edge cache lifetime for responses served under this purpose.
    pub fn cache_ttl_secs(self) -> u32 {
        match self {
            Purpose::Preview => 300,
            Purpose::Stream => 1800,
            Purpose::Download | Purpose::Transform => 900,
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = SignedUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Purpose::Download),
            "preview" => Ok(Purpose::Preview),
            "stream" => Ok(Purpose::Stream),
            "transform" => Ok(Purpose::Transform),
            other => Err(SignedUrlError::InvalidPurpose(other.to_string())),
        }
    }
}

/// An issued grant, ready to hand to a client.
#[derive(Debug, Clone, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Stateless gate holding the signing secret and the public base URL.
#[derive(Clone)]
pub struct SignedUrlGate {
    secret: Vec<u8>,
    base_url: String,
}

impl SignedUrlGate {
    pub fn new(secret: impl Into<Vec<u8>>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn signature(&self, object_key: &str, expires_millis: i64, purpose: Purpose) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(format!("{object_key}:{expires_millis}:{purpose}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue a grant valid for `ttl` starting now.
    pub fn issue(&self, object_key: &str, purpose: Purpose, ttl: Duration) -> SignedUrl {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let expires_millis = expires_at.timestamp_millis();
        let signature = self.signature(object_key, expires_millis, purpose);
        SignedUrl {
            url: format!(
                "{}/files/{}?expires={}&signature={}&purpose={}",
                self.base_url, object_key, expires_millis, signature, purpose
            ),
            expires_at,
        }
    }

    /// URL form for public files; carries no grant at all.
    pub fn public_url(&self, object_key: &str) -> String {
        format!("{}/public/{}", self.base_url, object_key)
    }

    /// Validate the query parameters presented with a gated read.
    ///
    /// `expires == now` is still valid; one millisecond past is not. The
    /// signature comparison is constant-time (`Mac::verify_slice`).
    pub fn validate(
        &self,
        object_key: &str,
        expires_millis: i64,
        signature_hex: &str,
        purpose: Purpose,
    ) -> Result<(), SignedUrlError> {
        self.validate_at(
            object_key,
            expires_millis,
            signature_hex,
            purpose,
            Utc::now().timestamp_millis(),
        )
    }

    fn validate_at(
        &self,
        object_key: &str,
        expires_millis: i64,
        signature_hex: &str,
        purpose: Purpose,
        now_millis: i64,
    ) -> Result<(), SignedUrlError> {
        if now_millis > expires_millis {
            return Err(SignedUrlError::Expired);
        }

        let presented = hex::decode(signature_hex).map_err(|_| SignedUrlError::InvalidSignature)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(format!("{object_key}:{expires_millis}:{purpose}").as_bytes());
        mac.verify_slice(&presented)
            .map_err(|_| SignedUrlError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SignedUrlGate {
        SignedUrlGate::new(b"test-secret".to_vec(), "http://localhost:3000/")
    }

    #[test]
    fn issue_embeds_all_parameters() {
        let signed = gate().issue("photos/cat.png", Purpose::Preview, Duration::from_secs(60));
        assert!(signed.url.starts_with("http://localhost:3000/files/photos/cat.png?"));
        assert!(signed.url.contains("expires="));
        assert!(signed.url.contains("signature="));
        assert!(signed.url.contains("purpose=preview"));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let g = gate();
        let now = Utc::now().timestamp_millis();
        let sig = g.signature("k", now, Purpose::Download);

        // expires == now is still valid
        assert_eq!(g.validate_at("k", now, &sig, Purpose::Download, now), Ok(()));
        // one millisecond past fails closed
        assert_eq!(
            g.validate_at("k", now, &sig, Purpose::Download, now + 1),
            Err(SignedUrlError::Expired)
        );
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let g = gate();
        let expires = Utc::now().timestamp_millis() + 60_000;
        let sig = g.signature("k", expires, Purpose::Download);

        let mut tampered = sig.clone().into_bytes();
        tampered[0] = if tampered[0] == b'a' { b'b' } else { b'a' };
        let tampered = String::from_utf8(tampered).unwrap();

        assert_eq!(g.validate("k", expires, &sig, Purpose::Download), Ok(()));
        assert_eq!(
            g.validate("k", expires, &tampered, Purpose::Download),
            Err(SignedUrlError::InvalidSignature)
        );
    }

    #[test]
    fn purpose_and_key_are_bound_into_the_signature() {
        let g = gate();
        let expires = Utc::now().timestamp_millis() + 60_000;
        let sig = g.signature("k", expires, Purpose::Download);

        assert_eq!(
            g.validate("k", expires, &sig, Purpose::Stream),
            Err(SignedUrlError::InvalidSignature)
        );
        assert_eq!(
            g.validate("other", expires, &sig, Purpose::Download),
            Err(SignedUrlError::InvalidSignature)
        );
    }

    #[test]
    fn non_hex_signature_is_rejected() {
        let g = gate();
        let expires = Utc::now().timestamp_millis() + 60_000;
        assert_eq!(
            g.validate("k", expires, "zz-not-hex", Purpose::Download),
            Err(SignedUrlError::InvalidSignature)
        );
    }

    #[test]
    fn purpose_cache_ceilings() {
        assert_eq!(Purpose::Preview.cache_ttl_secs(), 300);
        assert_eq!(Purpose::Stream.cache_ttl_secs(), 1800);
        assert_eq!(Purpose::Download.cache_ttl_secs(), 900);
        assert_eq!(Purpose::Transform.cache_ttl_secs(), 900);
    }
}
