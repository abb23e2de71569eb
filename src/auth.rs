//! Credential verification for producer and room connections.
//!
//! Producers present a bearer HS256 token minted by the token service; the
//! relay only validates it against the shared secret and extracts the
//! `{subject, username}` pair. Room participants carry the same-format token
//! in the ambient session cookie, yielding a `{id, login}` user record.

use axum::http::HeaderMap;
use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD as BASE64_URL_SAFE};
use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of an authenticated producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    pub username: String,
}

/// Identity of an authenticated room participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUser {
    pub id: String,
    pub login: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token missing subject")]
    MissingSubject,
    #[error("token missing username")]
    MissingUsername,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    login: Option<String>,
}

#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let key = DecodingKey::from_secret(&decode_secret(secret));
        let validation = Validation::new(Algorithm::HS256);
        Self { key, validation }
    }

    pub fn verify_producer(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = self.claims(token)?;
        let username = claims
            .username
            .or(claims.login)
            .ok_or(AuthError::MissingUsername)?;
        Ok(Principal {
            subject: claims.sub,
            username,
        })
    }

    pub fn verify_room_user(&self, token: &str) -> Result<RoomUser, AuthError> {
        let claims = self.claims(token)?;
        let login = claims
            .login
            .or(claims.username)
            .ok_or(AuthError::MissingUsername)?;
        Ok(RoomUser {
            id: claims.sub,
            login,
        })
    }

    fn claims(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let data = decode::<TokenClaims>(token, &self.key, &self.validation)?;
        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }
        Ok(data.claims)
    }
}

/// Secrets may arrive base64-encoded (standard or url-safe) or raw.
fn decode_secret(secret: &str) -> Vec<u8> {
    if let Ok(decoded) = BASE64_STANDARD.decode(secret) {
        if !decoded.is_empty() {
            return decoded;
        }
    }
    if let Ok(decoded) = BASE64_URL_SAFE.decode(secret) {
        if !decoded.is_empty() {
            return decoded;
        }
    }
    secret.as_bytes().to_vec()
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Extract a named cookie from the `Cookie` header.
pub fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in value.split(';') {
        let pair = pair.trim();
        if let Some((key, val)) = pair.split_once('=') {
            if key == name && !val.is_empty() {
                return Some(val.to_string());
            }
        }
    }
    None
}
