//! Cryptographic primitives: randomness, hashing, base64url, JWK import and
//! compact JWS signing.
//!
//! SMART asymmetric client authentication uses RS384 or ES384 (P-384); those
//! are the only algorithms [`import_jwk`] accepts.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p384::pkcs8::EncodePrivateKey as EcEncodePrivateKey;
use rand::RngCore;
use rsa::pkcs8::LineEnding;
use rsa::{BigUint, RsaPrivateKey};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::SmartResult;
use crate::error::SmartError;

/// Returns `n` cryptographically random bytes.
#[must_use]
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// SHA-256 digest of `input`.
#[must_use]
pub fn digest_sha256(input: &[u8]) -> Vec<u8> {
    Sha256::digest(input).to_vec()
}

/// Unpadded base64url encoding.
#[must_use]
pub fn base64url_encode(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

/// Base64url decoding that tolerates trailing padding.
///
/// # Errors
///
/// Returns [`SmartError::Validation`] for malformed input.
pub fn base64url_decode(input: &str) -> SmartResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| SmartError::validation(format!("Invalid base64url: {e}")))
}

/// Decodes the payload of a JWT without verifying it.
///
/// Used only to read claims of tokens this client received directly from the
/// token endpoint (`exp` of the access token, `id_token` claims).
#[must_use]
pub fn decode_jwt_payload(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64url_decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

// =============================================================================
// Signing keys
// =============================================================================

/// A private key ready for JWS signing.
#[derive(Clone)]
pub struct SigningKey {
    pub algorithm: Algorithm,
    pub kid: Option<String>,
    encoding_key: EncodingKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm)
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

fn jwk_str<'a>(jwk: &'a Value, field: &str) -> SmartResult<&'a str> {
    jwk.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| SmartError::validation(format!("JWK is missing the \"{field}\" member")))
}

fn jwk_uint(jwk: &Value, field: &str) -> SmartResult<BigUint> {
    let bytes = base64url_decode(jwk_str(jwk, field)?)?;
    Ok(BigUint::from_bytes_be(&bytes))
}

/// Imports a private JWK for signing.
///
/// The JWK must declare `alg` as `RS384` (with `kty: RSA`) or `ES384`
/// (with `kty: EC`, `crv: P-384`), and if `key_ops` is present it must
/// include `sign`.
///
/// # Errors
///
/// Returns [`SmartError::Validation`] for malformed or unsupported keys.
pub fn import_jwk(jwk: &Value) -> SmartResult<SigningKey> {
    let Some(alg) = jwk.get("alg").and_then(Value::as_str) else {
        return Err(SmartError::validation(
            "The \"alg\" member of the JWK must be set to \"ES384\" or \"RS384\"",
        ));
    };

    if let Some(ops) = jwk.get("key_ops") {
        let can_sign = ops
            .as_array()
            .is_some_and(|ops| ops.iter().any(|op| op.as_str() == Some("sign")));
        if !can_sign {
            return Err(SmartError::validation(
                "The \"key_ops\" member of the JWK does not include \"sign\"",
            ));
        }
    }

    let kid = jwk.get("kid").and_then(Value::as_str).map(str::to_string);
    let kty = jwk_str(jwk, "kty")?;

    let (algorithm, encoding_key) = match (alg, kty) {
        ("RS384", "RSA") => (Algorithm::RS384, rsa_encoding_key(jwk)?),
        ("ES384", "EC") => {
            let crv = jwk_str(jwk, "crv")?;
            if crv != "P-384" {
                return Err(SmartError::validation(format!(
                    "ES384 requires the P-384 curve, got {crv}"
                )));
            }
            (Algorithm::ES384, ec_encoding_key(jwk)?)
        }
        (alg, kty) => {
            return Err(SmartError::validation(format!(
                "Unsupported JWK: alg {alg} with kty {kty}. Use RS384 or ES384"
            )));
        }
    };

    Ok(SigningKey {
        algorithm,
        kid,
        encoding_key,
    })
}

fn rsa_encoding_key(jwk: &Value) -> SmartResult<EncodingKey> {
    let n = jwk_uint(jwk, "n")?;
    let e = jwk_uint(jwk, "e")?;
    let d = jwk_uint(jwk, "d")?;
    let primes = match (jwk.get("p"), jwk.get("q")) {
        (Some(_), Some(_)) => vec![jwk_uint(jwk, "p")?, jwk_uint(jwk, "q")?],
        _ => Vec::new(),
    };

    let private_key = RsaPrivateKey::from_components(n, e, d, primes)
        .map_err(|e| SmartError::validation(format!("Invalid RSA JWK: {e}")))?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| SmartError::security(e.to_string()))?;

    EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| SmartError::security(e.to_string()))
}

fn ec_encoding_key(jwk: &Value) -> SmartResult<EncodingKey> {
    let d = base64url_decode(jwk_str(jwk, "d")?)?;
    let secret_key = p384::SecretKey::from_slice(&d)
        .map_err(|e| SmartError::validation(format!("Invalid EC JWK: {e}")))?;
    let pem = secret_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| SmartError::security(e.to_string()))?;

    EncodingKey::from_ec_pem(pem.as_bytes())
        .map_err(|e| SmartError::security(e.to_string()))
}

/// Signs `claims` as a compact JWS.
///
/// `header.alg` is forced to the key's algorithm and `header.kid` defaults
/// to the key's `kid`.
///
/// # Errors
///
/// Returns [`SmartError::Security`] if signing fails.
pub fn sign_compact_jws<T: Serialize>(
    key: &SigningKey,
    mut header: Header,
    claims: &T,
) -> SmartResult<String> {
    header.alg = key.algorithm;
    if header.kid.is_none() {
        header.kid.clone_from(&key.kid);
    }
    jsonwebtoken::encode(&header, claims, &key.encoding_key)
        .map_err(|e| SmartError::security(format!("Failed to sign JWT: {e}")))
}
