//! Access token expiry decoding
//!
//! Access tokens are JWTs. Only the payload segment is read, and only to find
//! the `exp` claim so the store can record when the token expires. Signatures
//! are not verified; the API server is the authority on token validity.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Claims read from an access token payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    /// Expiry as a unix timestamp in seconds
    pub exp: i64,
    #[serde(default)]
    pub sub: Option<String>,
}

/// Decode the payload segment of a JWT into its claims.
///
/// Accepts payloads with or without base64 padding. Fails when the token does
/// not have three dot-separated segments, the payload is not base64url, or the
/// JSON lacks a numeric `exp`.
pub fn decode_claims(token: &str) -> Result<TokenClaims> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
        _ => {
            return Err(Error::TokenDecode(
                "expected three dot-separated segments".into(),
            ));
        }
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::TokenDecode(format!("payload is not base64url: {e}")))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| Error::TokenDecode(format!("invalid payload claims: {e}")))
}

/// Extract the `exp` claim (unix seconds) from an access token.
pub fn decode_expiry(token: &str) -> Result<i64> {
    decode_claims(token).map(|claims| claims.exp)
}
