//! Handshake identity
//!
//! Extracts the claimed user identifier from connection metadata. Anything that
//! does not name a user (absent, empty, or the literal `"undefined"` some
//! browser clients send) is treated as no identity and never registered.
//!
//! # Signed identities
//!
//! When a handshake secret is configured, the claimed user id must be backed by
//! a token minted by the authenticating collaborator:
//! 1. Encode user id: Base64Url(JSON(user_id)), unpadded
//! 2. Calculate HMAC-SHA256 digest of the encoded part
//! 3. Format: `${encoded}--${digest_hex}`

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Hex length of an HMAC-SHA256 digest
const SIGNATURE_HEX_LEN: usize = 64;

/// Literal sent by clients that have no logged-in user
pub const NO_IDENTITY: &str = "undefined";

/// Query parameters supplied when a connection is established
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "userId", default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// True when `user_id` does not name a user.
pub fn is_no_identity(user_id: &str) -> bool {
    let trimmed = user_id.trim();
    trimmed.is_empty() || trimmed == NO_IDENTITY
}

/// Resolve the identity a handshake carries.
///
/// Returns `None` for anonymous handshakes and for any token failure; callers
/// treat both the same way.
pub fn resolve(query: &HandshakeQuery, verifier: Option<&IdentityVerifier>) -> Option<String> {
    let user_id = query.user_id.as_deref().map(str::trim)?;
    if is_no_identity(user_id) {
        return None;
    }

    let Some(verifier) = verifier else {
        return Some(user_id.to_string());
    };

    let token = query.token.as_deref()?;
    match verifier.verify(token) {
        Ok(verified) if verified == user_id => Some(verified),
        Ok(verified) => {
            debug!(claimed = user_id, verified, "identity token names another user");
            None
        }
        Err(e) => {
            debug!(claimed = user_id, error = %e, "identity token rejected");
            None
        }
    }
}

/// HMAC-SHA256 verifier for identity tokens
pub struct IdentityVerifier {
    key: Vec<u8>,
}

impl IdentityVerifier {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    /// Verify a token and return the user id it carries
    pub fn verify(&self, token: &str) -> Result<String, VerifyError> {
        // The url-safe alphabet contains '-', the hex digest never does
        let (encoded, signature) = token.rsplit_once("--").ok_or(VerifyError::InvalidFormat)?;
        if signature.len() != SIGNATURE_HEX_LEN || !signature.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VerifyError::InvalidFormat);
        }

        let expected = self.digest(encoded.as_bytes())?;
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(VerifyError::InvalidSignature);
        }

        let json = String::from_utf8(URL_SAFE_NO_PAD.decode(encoded)?)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Mint a token for `user_id`
    pub fn sign(&self, user_id: &str) -> Result<String, VerifyError> {
        let json = serde_json::to_string(user_id)?;
        let encoded = URL_SAFE_NO_PAD.encode(json.as_bytes());
        let signature = self.digest(encoded.as_bytes())?;

        Ok(format!("{}--{}", encoded, signature))
    }

    fn digest(&self, data: &[u8]) -> Result<String, VerifyError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| VerifyError::InvalidKey)?;
        mac.update(data);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for IdentityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityVerifier").finish_non_exhaustive()
    }
}

/// Errors during token verification
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid token format")]
    InvalidFormat,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key")]
    InvalidKey,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
