use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: &str = "v1";

/// Signs a user id into a bearer token. The identity provider shares the
/// token secret and mints these at login; this service only ever verifies
/// them.
pub fn mint_user_token(secret: &str, user_id: &str) -> String {
    format!("{TOKEN_VERSION}.{user_id}.{}", user_sig(secret, user_id))
}

fn user_sig(secret: &str, user_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(TOKEN_VERSION.as_bytes());
    mac.update(b".");
    mac.update(user_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies `v1.<user_id>.<hex hmac>` and returns the user id.
pub fn verify_user_token(secret: &str, token: &str) -> Option<String> {
    let token = token.trim();
    let mut parts = token.splitn(3, '.');
    let version = parts.next()?;
    let user_id = parts.next()?;
    let sig = parts.next()?;
    if version != TOKEN_VERSION || user_id.is_empty() || sig.is_empty() {
        return None;
    }
    let expect = user_sig(secret, user_id);
    if expect.as_bytes().ct_eq(sig.as_bytes()).unwrap_u8() != 1 {
        return None;
    }
    Some(user_id.to_string())
}

/// Extracts and verifies the caller identity from the Authorization header.
pub fn require_user(state: &AppState, headers: &HeaderMap) -> ApiResult<String> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(str::trim)
        .unwrap_or("");
    if token.is_empty() {
        return Err(ApiError::unauthorized("authentication required"));
    }
    verify_user_token(&state.auth_token_secret, token)
        .ok_or_else(|| ApiError::unauthorized("invalid token"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-token-secret-0123456789";

    #[test]
    fn minted_tokens_verify_to_the_same_user() {
        let token = mint_user_token(SECRET, "user-42");
        assert_eq!(
            verify_user_token(SECRET, &token).as_deref(),
            Some("user-42")
        );
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let token = mint_user_token(SECRET, "user-42");
        let forged = token.replace("user-42", "user-43");
        assert_eq!(verify_user_token(SECRET, &forged), None);

        let mut truncated = token.clone();
        truncated.pop();
        assert_eq!(verify_user_token(SECRET, &truncated), None);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = mint_user_token(SECRET, "user-42");
        assert_eq!(verify_user_token("other-secret", &token), None);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for bad in ["", "v1", "v1.user", "v2.user.aabb", "v1..aabb", "v1.user."] {
            assert_eq!(verify_user_token(SECRET, bad), None, "token {bad:?}");
        }
    }
}
