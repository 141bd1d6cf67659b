//! Request authentication.
//!
//! Services call the API with a JWT whose subject is their service id
//! (`AuthService`). Providers posting delivery receipts present a shared key
//! in `X-Receipt-Key` (`ReceiptKey`).

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_common::error::AppError;

use crate::state::AppState;

pub const RECEIPT_KEY_HEADER: &str = "x-receipt-key";

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject: the calling service's UUID
    pub sub: String,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
}

/// Authenticated service extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthService {
    pub service_id: Uuid,
    pub claims: Claims,
}

/// Encode a JWT token for a service.
pub fn encode_jwt(service_id: Uuid, secret: &str, expiry_hours: i64) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + Duration::hours(expiry_hours);

    let claims = Claims {
        sub: service_id.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))
}

/// Decode and validate a JWT token.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    Ok(token_data.claims)
}

impl FromRequestParts<AppState> for AuthService {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let secret = state
            .config
            .jwt_secret
            .as_deref()
            .ok_or_else(|| AppError::Config("JWT_SECRET is not configured".to_string()))?;

        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| {
                AppError::Auth("Missing or invalid Authorization header. Use 'Bearer <JWT>'".to_string())
            })?;

        let claims = decode_jwt(token, secret)?;
        let service_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AppError::Auth("Invalid service ID in token".to_string()))?;

        Ok(AuthService { service_id, claims })
    }
}

/// Proof that the request carried the configured receipt key.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptKey;

impl FromRequestParts<AppState> for ReceiptKey {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.receipt_api_key.as_deref() else {
            return Err(AppError::Forbidden(
                "Receipt ingestion is not enabled".to_string(),
            ));
        };

        let presented = parts
            .headers
            .get(RECEIPT_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Auth("Missing X-Receipt-Key header".to_string()))?;

        if !keys_match(presented, expected) {
            return Err(AppError::Auth("Invalid receipt key".to_string()));
        }
        Ok(ReceiptKey)
    }
}

/// Comparison that does not short-circuit on the first differing byte.
fn keys_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-secret-key-for-unit-tests";

    #[test]
    fn test_encode_decode_jwt() {
        let service_id = Uuid::new_v4();
        let token = encode_jwt(service_id, TEST_SECRET, 24).unwrap();
        let claims = decode_jwt(&token, TEST_SECRET).unwrap();
        assert_eq!(claims.sub, service_id.to_string());
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_invalid_secret_rejected() {
        let token = encode_jwt(Uuid::new_v4(), TEST_SECRET, 24).unwrap();
        assert!(decode_jwt(&token, "wrong-secret").is_err());
    }

    #[test]
    fn test_expired_jwt_rejected() {
        // Past the default 60s leeway.
        let token = encode_jwt(Uuid::new_v4(), TEST_SECRET, -1).unwrap();
        assert!(decode_jwt(&token, TEST_SECRET).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(decode_jwt("not.a.valid.jwt", TEST_SECRET).is_err());
    }

    #[test]
    fn test_keys_match() {
        assert!(keys_match("receipt-key", "receipt-key"));
        assert!(!keys_match("receipt-kez", "receipt-key"));
        assert!(!keys_match("receipt", "receipt-key"));
        assert!(!keys_match("", "receipt-key"));
    }
}
