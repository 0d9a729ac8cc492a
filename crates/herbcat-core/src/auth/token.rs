//! Bearer token inspection.
//!
//! Reads the payload segment of a `header.payload.signature` token far enough
//! to learn when it expires and who it belongs to. Signatures are never
//! checked here; the server that issued the token is the one that trusts it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::AuthError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedClaims {
    pub expires_at: DateTime<Utc>,
    pub subject_id: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    exp: Option<serde_json::Number>,
    sub: Option<Value>,
    id: Option<Value>,
    role: Option<Value>,
}

/// Decode the claims of a bearer token without verifying it.
///
/// # Errors
///
/// Returns `AuthError::MalformedToken` if:
/// - The token does not have exactly 3 non-empty dot-separated parts
/// - The payload is not base64url
/// - The payload is not a JSON object
/// - The `exp` claim is missing or not a number
pub fn decode(token: &str) -> Result<DecodedClaims, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 || parts[1].is_empty() {
        return Err(AuthError::MalformedToken(
            "token must have 3 parts separated by dots".to_string(),
        ));
    }

    // Some issuers pad the segment; the url-safe alphabet itself is unpadded.
    let payload = parts[1].trim_end_matches('=');
    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::MalformedToken(format!("failed to decode payload: {}", e)))?;

    let raw: RawClaims = serde_json::from_slice(&payload_bytes)
        .map_err(|e| AuthError::MalformedToken(format!("failed to parse claims: {}", e)))?;

    let exp = raw
        .exp
        .ok_or_else(|| AuthError::MalformedToken("missing exp claim".to_string()))?;
    let expires_at = numeric_date(&exp)
        .ok_or_else(|| AuthError::MalformedToken(format!("exp claim out of range: {}", exp)))?;

    Ok(DecodedClaims {
        expires_at,
        subject_id: raw.sub.or(raw.id).and_then(claim_to_string),
        role: raw.role.and_then(claim_to_string),
    })
}

/// NumericDate is seconds since the epoch, possibly fractional.
fn numeric_date(exp: &serde_json::Number) -> Option<DateTime<Utc>> {
    let millis = match exp.as_i64() {
        Some(secs) => secs.checked_mul(1000)?,
        None => {
            let secs = exp.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            (secs * 1000.0).round() as i64
        }
    };
    Utc.timestamp_millis_opt(millis).single()
}

fn claim_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
