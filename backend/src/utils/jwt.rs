use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::types::{SessionId, SubjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Session,
    Access,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub jti: String, // session id
    pub sub: String, // subject id
    pub token_type: TokenKind,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime_allowed: Option<bool>,
}

impl Claims {
    pub fn session_id(&self) -> Result<SessionId, TokenError> {
        self.jti.parse().map_err(|_| TokenError::MalformedClaims)
    }

    pub fn subject_id(&self) -> SubjectId {
        SubjectId::new(self.sub.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token rejected: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("expected a {expected:?} token")]
    WrongKind { expected: TokenKind },
    #[error("token claims are malformed")]
    MalformedClaims,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub session_token_ttl: Duration,
    pub access_token_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies the HS256 bearer credentials tied to a session.
#[derive(Clone)]
pub struct TokenSigner {
    config: TokenConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenSigner {
    pub fn new(config: TokenConfig) -> Self {
        let encoding = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config,
            encoding,
            decoding,
        }
    }

    pub fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Session => self.config.session_token_ttl,
            TokenKind::Access => self.config.access_token_ttl,
        }
    }

    pub fn issue(
        &self,
        kind: TokenKind,
        session_id: SessionId,
        subject_id: &SubjectId,
    ) -> Result<IssuedToken, TokenError> {
        let now = Utc::now();
        let expires_at = now + self.ttl(kind);
        let claims = Claims {
            jti: session_id.to_string(),
            sub: subject_id.to_string(),
            token_type: kind,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            realtime_allowed: (kind == TokenKind::Access).then_some(true),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Verifies signature, issuer, audience and expiry with zero leeway, then
    /// checks the token is of the expected kind.
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let claims = decode::<Claims>(token, &self.decoding, &validation)?.claims;
        if claims.token_type != kind {
            return Err(TokenError::WrongKind { expected: kind });
        }
        Ok(claims)
    }
}
