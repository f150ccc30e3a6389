//! PKCE (Proof Key for Code Exchange) for the authorization code flow.
//!
//! Implements RFC 7636 with the S256 method only; SMART on FHIR forbids
//! `plain`. Whether a challenge is sent at all is decided by [`PkceMode`]
//! against the methods the server declares in its SMART configuration.
//!
//! # Example
//!
//! ```
//! use octofhir_smart_client::pkce::{PkceChallenge, PkceVerifier};
//!
//! let verifier = PkceVerifier::generate();
//! let challenge = PkceChallenge::from_verifier(&verifier);
//! assert_eq!(challenge.as_str().len(), 43);
//! ```

use serde::{Deserialize, Serialize};

use crate::SmartResult;
use crate::error::SmartError;
use crate::security::{base64url_encode, digest_sha256, random_bytes};

/// Default verifier entropy in bytes (encodes to 128 characters).
pub const DEFAULT_ENTROPY: usize = 96;

// =============================================================================
// PKCE Mode
// =============================================================================

/// Policy deciding whether the authorization request carries a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PkceMode {
    /// Never send a challenge.
    #[serde(rename = "disabled")]
    Disabled,
    /// Always send a challenge; fail if the server does not declare S256.
    #[serde(rename = "required")]
    Required,
    /// Always send a challenge, even if the server does not declare S256.
    /// For servers that support PKCE without advertising it.
    #[serde(rename = "unsafeV1")]
    UnsafeV1,
    /// Send a challenge only when the server declares S256.
    #[default]
    #[serde(rename = "auto")]
    Auto,
}

impl PkceMode {
    /// Decides whether to include a code challenge.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::Configuration`] in `Required` mode when
    /// `S256` is not among `supported_methods`.
    pub fn should_include_challenge(self, supported_methods: &[String]) -> SmartResult<bool> {
        let s256_supported = supported_methods.iter().any(|m| m == "S256");
        match self {
            Self::Disabled => Ok(false),
            Self::UnsafeV1 => Ok(true),
            Self::Required if !s256_supported => Err(SmartError::configuration(
                "Required PKCE code challenge method (`S256`) was not found in the server's \
                 code_challenge_methods_supported declaration",
            )),
            Self::Required => Ok(true),
            Self::Auto => Ok(s256_supported),
        }
    }
}

// =============================================================================
// PKCE Verifier
// =============================================================================

/// PKCE code verifier: 43-128 characters from `[A-Za-z0-9-._~]`.
#[derive(Debug, Clone)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    /// Wraps an existing verifier.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::Validation`] if the length is outside 43-128 or
    /// the verifier contains characters outside the unreserved set.
    pub fn new(verifier: String) -> SmartResult<Self> {
        let len = verifier.len();
        if !(43..=128).contains(&len) {
            return Err(SmartError::validation(format!(
                "Invalid PKCE verifier length: must be 43-128 characters, got {len}"
            )));
        }
        if !verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
        {
            return Err(SmartError::validation(
                "Invalid PKCE verifier characters: must be [A-Za-z0-9-._~]",
            ));
        }
        Ok(Self(verifier))
    }

    /// Generates a verifier from [`DEFAULT_ENTROPY`] random bytes.
    #[must_use]
    pub fn generate() -> Self {
        Self(base64url_encode(&random_bytes(DEFAULT_ENTROPY)))
    }

    /// Generates a verifier from `entropy` random bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SmartError::Validation`] unless `entropy` is 32-96 bytes,
    /// the range that encodes to a legal verifier length.
    pub fn with_entropy(entropy: usize) -> SmartResult<Self> {
        if !(32..=96).contains(&entropy) {
            return Err(SmartError::validation(format!(
                "PKCE entropy must be 32-96 bytes, got {entropy}"
            )));
        }
        Ok(Self(base64url_encode(&random_bytes(entropy))))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

// =============================================================================
// PKCE Challenge
// =============================================================================

/// S256 code challenge: `BASE64URL(SHA256(ASCII(code_verifier)))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceChallenge(String);

impl PkceChallenge {
    #[must_use]
    pub fn from_verifier(verifier: &PkceVerifier) -> Self {
        Self(base64url_encode(&digest_sha256(verifier.0.as_bytes())))
    }

    /// The challenge method sent with the authorization request.
    #[must_use]
    pub fn method(&self) -> &'static str {
        "S256"
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

/// A verifier with its challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub code_verifier: String,
    pub code_challenge: String,
}

/// Generates a verifier from `entropy` random bytes and its S256 challenge.
///
/// # Errors
///
/// See [`PkceVerifier::with_entropy`].
pub fn generate_pkce_challenge(entropy: usize) -> SmartResult<PkcePair> {
    let verifier = PkceVerifier::with_entropy(entropy)?;
    let challenge = PkceChallenge::from_verifier(&verifier);
    Ok(PkcePair {
        code_verifier: verifier.into_inner(),
        code_challenge: challenge.into_inner(),
    })
}
