//! Upgrade-time authentication.
//!
//! Clients present an HS256 token either as `?token=` on the upgrade URL or
//! as an `Authorization: Bearer` header. The claims name the user and the
//! device the connection belongs to.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use relay_core::{Identity, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token on the request.
    #[error("missing token")]
    Missing,

    /// Token failed signature, expiry or issuer checks.
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

fn default_device() -> String {
    "default".to_string()
}

/// Token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_device")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
}

impl Claims {
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.user_id, self.username.clone(), self.device_id.clone())
    }
}

/// Validates tokens against a shared secret.
#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
            validation.set_required_spec_claims(&["exp", "iss"]);
        }
        Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    /// Check a token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if the signature, expiry or issuer check fails.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        Ok(decode::<Claims>(token, &self.key, &self.validation)?.claims)
    }

    /// Find the token on a request and validate it.
    ///
    /// # Errors
    ///
    /// Returns `Missing` if neither the query nor the header carries one.
    pub fn authenticate(
        &self,
        query_token: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<Claims, AuthError> {
        let token = extract_token(query_token, headers).ok_or(AuthError::Missing)?;
        self.validate(token)
    }
}

/// Token from the query string, falling back to a bearer header.
#[must_use]
pub fn extract_token<'a>(query_token: Option<&'a str>, headers: &'a HeaderMap) -> Option<&'a str> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some(token);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
pub(crate) fn issue_token(secret: &str, claims: &Claims) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
pub(crate) fn test_claims(user_id: UserId) -> Claims {
    let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap();
    Claims {
        user_id,
        username: "alice".to_string(),
        email: None,
        device_id: "web".to_string(),
        session_id: None,
        iss: None,
        exp: now + 3600,
        iat: now,
    }
}
