use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use relay_core::{Identity, UserId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AuthConfig;
use crate::errors::AuthError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id, as a decimal string.
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

/// Issues and validates HS256 tokens. Holds no mutable state.
pub struct IdentityGate {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl IdentityGate {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            access_ttl_secs: i64::try_from(config.access_ttl_secs).unwrap_or(i64::MAX),
            refresh_ttl_secs: i64::try_from(config.refresh_ttl_secs).unwrap_or(i64::MAX),
        }
    }

    pub fn issue_access(&self, identity: &Identity) -> Result<String, AuthError> {
        self.sign(
            identity.user_id,
            Some(identity.username.clone()),
            TokenKind::Access,
            self.access_ttl_secs,
        )
    }

    pub fn issue_refresh(&self, user_id: UserId) -> Result<String, AuthError> {
        self.sign(user_id, None, TokenKind::Refresh, self.refresh_ttl_secs)
    }

    /// Validate an access token and yield the identity it names.
    pub fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.decode(token, TokenKind::Access)?;
        let user_id = parse_subject(&claims.sub)?;
        let username = claims
            .username
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AuthError::Rejected("missing username claim".into()))?;
        Ok(Identity::new(user_id, username))
    }

    /// Validate a refresh token and yield the user id it names.
    pub fn validate_refresh(&self, token: &str) -> Result<UserId, AuthError> {
        let claims = self.decode(token, TokenKind::Refresh)?;
        parse_subject(&claims.sub)
    }

    fn sign(
        &self,
        user_id: UserId,
        username: Option<String>,
        kind: TokenKind,
        ttl_secs: i64,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            username,
            kind,
            iat: now,
            exp: now.saturating_add(ttl_secs),
            iss: self.issuer.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    fn decode(&self, token: &str, expected: TokenKind) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Rejected(e.to_string()),
            })?;

        if data.claims.kind != expected {
            debug!(kind = ?data.claims.kind, ?expected, "token kind mismatch");
            return Err(AuthError::Rejected("wrong token kind".into()));
        }
        Ok(data.claims)
    }
}

fn parse_subject(sub: &str) -> Result<UserId, AuthError> {
    sub.parse::<i64>()
        .map(UserId)
        .map_err(|_| AuthError::Rejected(format!("invalid subject: {sub}")))
}
