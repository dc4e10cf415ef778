// Credential decoding
// Reads the claims segment of a JWT-style credential for refresh scheduling

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;

use super::types::TokenClaims;
use crate::error::{ClientError, Result};

/// Decode the claims segment of `header.claims.signature`
///
/// The signature is not verified; the client only needs `exp` to know when
/// to refresh. Padding is optional and the standard alphabet is tolerated
/// as well as the URL-safe one.
pub fn decode_claims(token: &str) -> Result<TokenClaims> {
    let mut segments = token.split('.');
    let claims_segment = match (segments.next(), segments.next()) {
        (Some(_), Some(claims)) if !claims.is_empty() => claims,
        _ => {
            return Err(ClientError::MalformedCredential(
                "credential has no claims segment".to_string(),
            ))
        }
    };

    let trimmed = claims_segment.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|e| ClientError::MalformedCredential(format!("claims are not base64: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| ClientError::MalformedCredential(format!("claims are not valid JSON: {}", e)))
}

/// Build an unsigned credential carrying the given claims
#[cfg(test)]
pub fn encode_unsigned(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, body)
}
