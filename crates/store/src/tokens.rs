use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Role;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("signature mismatch")]
    BadSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub role: Role,
}

/// Issues and validates bearer tokens carrying `{sub, email, role}`, per
/// spec.md §6.3. The web/auth surface that issues these over HTTP is out of
/// scope; this trait is the seam the orchestrator's callers use to prove
/// identity.
#[async_trait]
pub trait Tokens: Send + Sync {
    fn issue(&self, claims: &Claims) -> String;
    fn validate(&self, token: &str) -> Result<Claims, TokenError>;
}

/// A symmetric-key signer: `base64(payload).hex(sha256(secret || payload))`.
/// Adequate for an internal service boundary; a production deployment would
/// swap this for the same externally-issued tokens the REST layer validates.
pub struct HmacTokens {
    secret: Vec<u8>,
}

impl HmacTokens {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn sign(&self, payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(payload);
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl Tokens for HmacTokens {
    fn issue(&self, claims: &Claims) -> String {
        let payload = serde_json::to_vec(claims).expect("claims always serialize");
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);
        let sig = self.sign(&payload);
        format!("{payload_b64}.{sig}")
    }

    fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let (payload_b64, sig) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let expected = self.sign(&payload);
        if expected != sig {
            return Err(TokenError::BadSignature);
        }
        serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)
    }
}
