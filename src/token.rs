//! Signed tokens handed to the device.
//!
//! Two kinds:
//! - completion tokens, minted by the ad gate when an impression satisfies the
//!   watch policy and required by `activate`;
//! - access tokens (HS256 JWT) binding session, MAC and RADIUS username, used
//!   for later status checks and self-service disconnect.

use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::ads::ImpressionId;
use crate::error::{AccessError, AccessResult};
use crate::mac::MacAddress;
use crate::session::SessionId;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Session id.
    pub sid: String,
    /// Normalized MAC address.
    pub mac: String,
    /// RADIUS username.
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Verified contents of a completion token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionGrant {
    pub impression_id: ImpressionId,
    pub session_id: SessionId,
}

#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    issuer: String,
    lifetime_secs: u64,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("issuer", &self.issuer)
            .field("lifetime_secs", &self.lifetime_secs)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>, issuer: impl Into<String>, lifetime_secs: u64) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            issuer: issuer.into(),
            lifetime_secs,
        }
    }

    pub fn lifetime_secs(&self) -> u64 {
        self.lifetime_secs
    }

    // -----------------------------------------------------------------------
    // Completion tokens
    // -----------------------------------------------------------------------

    fn completion_mac(&self, impression: ImpressionId, session: SessionId) -> HmacSha256 {
        // HMAC accepts keys of any length, so this cannot fail.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC key length is unrestricted"));
        mac.update(b"completion:");
        mac.update(impression.to_string().as_bytes());
        mac.update(b".");
        mac.update(session.to_string().as_bytes());
        mac
    }

    /// `impression.session.hex(hmac)`.
    pub fn issue_completion(&self, impression: ImpressionId, session: SessionId) -> String {
        let tag = self.completion_mac(impression, session).finalize().into_bytes();
        format!("{}.{}.{}", impression, session, hex::encode(tag))
    }

    /// Check signature and shape. Says nothing about the impression's current
    /// state; the caller re-reads it from the store.
    pub fn verify_completion(&self, token: &str) -> AccessResult<CompletionGrant> {
        let bad = || AccessError::unauthorized("invalid completion token");

        let mut parts = token.trim().splitn(3, '.');
        let (imp, sid, tag) = match (parts.next(), parts.next(), parts.next()) {
            (Some(i), Some(s), Some(t)) if !i.is_empty() && !s.is_empty() => (i, s, t),
            _ => return Err(bad()),
        };
        let impression_id: ImpressionId = imp.parse().map_err(|_| bad())?;
        let session_id: SessionId = sid.parse().map_err(|_| bad())?;
        let tag = hex::decode(tag).map_err(|_| bad())?;

        self.completion_mac(impression_id, session_id)
            .verify_slice(&tag)
            .map_err(|_| bad())?;

        Ok(CompletionGrant {
            impression_id,
            session_id,
        })
    }

    // -----------------------------------------------------------------------
    // Access tokens
    // -----------------------------------------------------------------------

    pub fn issue_access(&self, session: SessionId, mac: MacAddress) -> AccessResult<String> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sid: session.to_string(),
            mac: mac.to_string(),
            sub: mac.username(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now + self.lifetime_secs as i64,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| AccessError::Upstream(anyhow::anyhow!("failed to sign access token: {}", e)))
    }

    /// Signature, expiry and issuer. Any failure is `Unauthorized`.
    pub fn verify_access(&self, token: &str) -> AccessResult<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["sub", "exp", "iat", "iss"]);

        jsonwebtoken::decode::<AccessClaims>(
            token.trim(),
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                AccessError::unauthorized("access token expired")
            }
            _ => AccessError::unauthorized(format!("invalid access token: {}", e)),
        })
    }
}
