//! Token authorization for tunnel sessions and the admin API

use async_trait::async_trait;
use axum::http::{header, HeaderMap, Uri};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing access token")]
    MissingToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// Subject of tokens allowed to use the admin API
pub const ADMIN_SUBJECT: &str = "*";

/// What a verified token allows its holder to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grants {
    /// Subject: the device or account the token was issued to
    pub sub: String,
    #[serde(default)]
    pub aud: String,
    /// Servernames the device may receive traffic for (`*.example.com` allowed)
    #[serde(default)]
    pub domains: Vec<String>,
    /// Raw TCP ports the device may receive traffic for
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Grants {
    pub fn new(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            ..Default::default()
        }
    }

    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn is_admin(&self) -> bool {
        self.sub == ADMIN_SUBJECT
    }

    /// Fill in a missing subject from the first label of the first domain.
    /// A wildcard domain never yields the admin subject.
    fn normalize(mut self) -> Self {
        if self.sub.is_empty() {
            if let Some(first) = self.domains.first() {
                let label = first
                    .trim_start_matches("*.")
                    .split('.')
                    .next()
                    .unwrap_or_default();
                if label != ADMIN_SUBJECT {
                    self.sub = label.to_string();
                }
            }
        }
        self
    }
}

/// Verifies access tokens
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, token: &str) -> Result<Grants, AuthError>;
}

/// Token from `Authorization: Bearer <token>`, or the `access_token` query
/// parameter for clients (browsers) that cannot set headers
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split_once(' '))
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "access_token")
        .map(|(_, value)| value.to_string())
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    #[serde(flatten)]
    grants: Grants,
    exp: i64,
    #[serde(default)]
    iat: i64,
}

/// HMAC-SHA256 token verifier
pub struct JwtAuthorizer {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthorizer {
    /// Verifies signature and expiry only
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Sign a token carrying `grants`, valid for `validity`
    pub fn issue(secret: &[u8], grants: &Grants, validity: Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = TokenClaims {
            grants: grants.clone(),
            exp: (now + validity).timestamp(),
            iat: now.timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<Grants, AuthError> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        let grants = data.claims.grants.normalize();
        if grants.sub.is_empty() {
            return Err(AuthError::InvalidToken("token has no subject".to_string()));
        }
        debug!(subject = %grants.sub, domains = ?grants.domains, "token verified");
        Ok(grants)
    }
}

#[async_trait]
impl Authorizer for JwtAuthorizer {
    async fn authorize(&self, token: &str) -> Result<Grants, AuthError> {
        self.verify(token)
    }
}
