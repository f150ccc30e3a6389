//! JWT client assertions for asymmetric client authentication (RFC 7523).
//!
//! A client registered with a public key authenticates at the token endpoint
//! by sending `client_assertion_type` and a short-lived `client_assertion`
//! signed with its private key instead of a client secret.

use jsonwebtoken::Header;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::SmartResult;
use crate::security::{SigningKey, base64url_encode, random_bytes, sign_compact_jws};

/// Value of the `client_assertion_type` form parameter.
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Assertion lifetime in seconds.
pub const ASSERTION_LIFETIME_SECS: i64 = 120;

/// JWT claims of a client assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAssertionClaims {
    /// Issuer - the client_id.
    pub iss: String,

    /// Subject - the client_id.
    pub sub: String,

    /// Audience - the token endpoint URL.
    pub aud: String,

    /// Expiration time as Unix timestamp.
    pub exp: i64,

    /// JWT ID, random per assertion.
    pub jti: String,
}

impl ClientAssertionClaims {
    /// Claims for `client_id` authenticating at `token_uri`, valid from `now`.
    #[must_use]
    pub fn new(client_id: &str, token_uri: &str, now: i64) -> Self {
        Self {
            iss: client_id.to_string(),
            sub: client_id.to_string(),
            aud: token_uri.to_string(),
            exp: now + ASSERTION_LIFETIME_SECS,
            jti: base64url_encode(&random_bytes(32)),
        }
    }
}

/// Builds and signs a client assertion.
///
/// The JWS header carries `typ: JWT`, the key's algorithm and its `kid`.
///
/// # Errors
///
/// Returns [`SmartError::Security`](crate::SmartError::Security) if signing fails.
pub fn build_client_assertion(
    client_id: &str,
    token_uri: &str,
    key: &SigningKey,
) -> SmartResult<String> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let claims = ClientAssertionClaims::new(client_id, token_uri, now);
    let mut header = Header::new(key.algorithm);
    header.typ = Some("JWT".to_string());
    sign_compact_jws(key, header, &claims)
}
