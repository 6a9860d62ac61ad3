//! Bearer credential verification.
//!
//! Credentials are HS256 JWTs. An `exp` claim is optional but enforced
//! when present. `verify` is strict and fails with
//! `InvalidCredential`; `resolve_optional` degrades any failure to "no
//! identity" and leaves the decision to the operation being served.

use crate::{IrlError, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const ADMIN_ROLE: &str = "admin";

/// Default lifetime of credentials issued by [`AuthContext::sign`]
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Token payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId", alias = "sub")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Expiry in seconds since the epoch; tokens without one never expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: None,
            exp: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Verified caller. Recomputed from the credential on every request and
/// connection, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub subject: String,
    pub role: Option<String>,
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }
}

impl From<Claims> for Identity {
    fn from(c: Claims) -> Self {
        Self {
            subject: c.user_id,
            role: c.role,
            claims: c.extra,
        }
    }
}

/// Verifies (and for tooling, issues) credentials against one shared secret.
pub struct AuthContext {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl AuthContext {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims::<&str>(&[]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a bare token (no prefix).
    pub fn verify(&self, token: &str) -> Result<Identity> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| Identity::from(data.claims))
            .map_err(|e| IrlError::InvalidCredential(e.to_string()))
    }

    /// Resolve a raw `Authorization` header or connection parameter.
    /// Absent, empty or invalid credentials all yield `None`.
    pub fn resolve_optional(&self, raw: Option<&str>) -> Option<Identity> {
        let token = strip_bearer(raw?.trim());
        if token.is_empty() {
            return None;
        }
        match self.verify(token) {
            Ok(identity) => {
                debug!(subject = %identity.subject, "Credential verified");
                Some(identity)
            }
            Err(e) => {
                warn!(error = %e, "Credential rejected, continuing unauthenticated");
                None
            }
        }
    }

    /// Issue a credential expiring after `ttl`.
    pub fn sign(&self, mut claims: Claims, ttl: Duration) -> Result<String> {
        claims.exp = Some((Utc::now().timestamp().max(0) as u64).saturating_add(ttl.as_secs()));
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| IrlError::InvalidCredential(e.to_string()))
    }
}

/// Strip a case-insensitive `Bearer` prefix followed by whitespace.
fn strip_bearer(raw: &str) -> &str {
    match raw.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim_start(),
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> AuthContext {
        AuthContext::new("test-secret")
    }

    #[test]
    fn sign_then_verify_yields_identity() {
        let a = auth();
        let mut claims = Claims::new("u1").with_role("admin");
        claims.extra.insert("org".into(), serde_json::json!("irl"));
        let token = a.sign(claims, DEFAULT_TOKEN_TTL).unwrap();

        let id = a.verify(&token).unwrap();
        assert_eq!(id.subject, "u1");
        assert!(id.is_admin());
        assert_eq!(id.claims["org"], "irl");
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let token = AuthContext::new("other")
            .sign(Claims::new("u1"), DEFAULT_TOKEN_TTL)
            .unwrap();
        assert!(matches!(
            auth().verify(&token),
            Err(IrlError::InvalidCredential(_))
        ));
    }

    #[test]
    fn expired_token_is_invalid() {
        let a = auth();
        let mut claims = Claims::new("u1");
        claims.exp = Some((Utc::now().timestamp() - 60) as u64);
        let token = encode(&Header::new(Algorithm::HS256), &claims, &a.encoding).unwrap();
        assert!(a.verify(&token).is_err());
    }

    #[test]
    fn token_without_expiry_is_accepted() {
        let a = auth();
        let claims = Claims::new("u1").with_role("admin");
        let token = encode(&Header::new(Algorithm::HS256), &claims, &a.encoding).unwrap();

        let id = a.verify(&token).unwrap();
        assert_eq!(id.subject, "u1");
        assert!(id.is_admin());
        assert!(a.resolve_optional(Some(&format!("Bearer {token}"))).is_some());
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(auth().verify("not.a.jwt").is_err());
    }

    #[test]
    fn resolve_optional_strips_prefix_any_case() {
        let a = auth();
        let token = a.sign(Claims::new("u1"), DEFAULT_TOKEN_TTL).unwrap();
        for raw in [
            format!("Bearer {token}"),
            format!("bearer   {token}"),
            format!("BEARER\t{token}"),
            token.clone(),
        ] {
            assert_eq!(
                a.resolve_optional(Some(&raw)).map(|i| i.subject),
                Some("u1".to_string()),
                "raw = {raw}"
            );
        }
    }

    #[test]
    fn resolve_optional_degrades_to_none() {
        let a = auth();
        assert!(a.resolve_optional(None).is_none());
        assert!(a.resolve_optional(Some("")).is_none());
        assert!(a.resolve_optional(Some("Bearer ")).is_none());
        assert!(a.resolve_optional(Some("Bearer garbage")).is_none());
    }

    #[test]
    fn sub_is_accepted_for_user_id() {
        let c: Claims = serde_json::from_str(r#"{"sub":"u9","exp":1}"#).unwrap();
        assert_eq!(c.user_id, "u9");
        assert_eq!(c.exp, Some(1));
    }
}
