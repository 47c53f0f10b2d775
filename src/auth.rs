// ABOUTME: HS256 JWT issuing and validation for real-time channel handshakes
// ABOUTME: Access, refresh, and mfa-pending tokens; only access tokens may open a connection

use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

use parley_core::config::AuthConfig;

/// HMAC keys shorter than this are zero-padded.
const MIN_SECRET_BYTES: usize = 32;
const EPHEMERAL_SECRET_BYTES: usize = 64;
const MFA_PENDING_TTL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenType {
    Access,
    Refresh,
    MfaPending,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
            TokenType::MfaPending => "mfa-pending",
        }
    }
}

/// Wire claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(rename = "type")]
    token_type: TokenType,
    iat: i64,
    exp: i64,
}

/// Validated identity extracted from a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub subject: String,
    pub token_type: TokenType,
    pub expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    Missing,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("expected an access token, got {0}")]
    WrongType(&'static str),
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl AuthError {
    /// Label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing",
            AuthError::Malformed(_) => "malformed",
            AuthError::InvalidSignature => "bad_signature",
            AuthError::Expired => "expired",
            AuthError::WrongType(_) => "wrong_type",
            AuthError::Signing(_) => "signing",
        }
    }
}

/// Validates bearer tokens presented by connecting clients.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<TokenClaims, AuthError>;

    /// Validate and additionally require an access token.
    fn validate_access(&self, token: &str) -> Result<TokenClaims, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::Missing);
        }
        let claims = self.validate(token)?;
        if claims.token_type != TokenType::Access {
            return Err(AuthError::WrongType(claims.token_type.as_str()));
        }
        Ok(claims)
    }
}

pub struct JwtTokenProvider {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl JwtTokenProvider {
    pub fn from_config(config: &AuthConfig) -> Self {
        let secret = match config.jwt_secret.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!(
                    "No JWT secret configured, generated an ephemeral secret (tokens won't survive restart)"
                );
                ephemeral_secret().into_bytes()
            }
        };
        Self::new(
            &secret,
            Duration::minutes(config.access_token_minutes),
            Duration::days(config.refresh_token_days),
        )
    }

    pub fn new(secret: &[u8], access_ttl: Duration, refresh_ttl: Duration) -> Self {
        let key = pad_secret(secret);
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding_key: EncodingKey::from_secret(&key),
            decoding_key: DecodingKey::from_secret(&key),
            validation,
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn issue_access_token(&self, subject: &str) -> Result<String, AuthError> {
        self.issue(subject, TokenType::Access, self.access_ttl)
    }

    pub fn issue_refresh_token(&self, subject: &str) -> Result<String, AuthError> {
        self.issue(subject, TokenType::Refresh, self.refresh_ttl)
    }

    pub fn issue_mfa_pending_token(&self, subject: &str) -> Result<String, AuthError> {
        self.issue(
            subject,
            TokenType::MfaPending,
            Duration::seconds(MFA_PENDING_TTL_SECS),
        )
    }

    /// Sign a token valid for `ttl` from now. A negative ttl yields an already expired token.
    pub fn issue(&self, subject: &str, token_type: TokenType, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            token_type,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }
}

impl TokenValidator for JwtTokenProvider {
    fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::Malformed(e.to_string()),
            }
        })?;
        let expires_at = chrono::DateTime::from_timestamp(data.claims.exp, 0)
            .ok_or_else(|| AuthError::Malformed("exp out of range".to_string()))?;
        Ok(TokenClaims {
            subject: data.claims.sub,
            token_type: data.claims.token_type,
            expires_at,
        })
    }
}

impl std::fmt::Debug for JwtTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtTokenProvider")
            .field("key", &"[REDACTED]")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

fn pad_secret(secret: &[u8]) -> Vec<u8> {
    let mut key = secret.to_vec();
    if key.len() < MIN_SECRET_BYTES {
        key.resize(MIN_SECRET_BYTES, 0);
    }
    key
}

fn ephemeral_secret() -> String {
    let mut bytes = [0u8; EPHEMERAL_SECRET_BYTES];
    rand::thread_rng().fill(&mut bytes[..]);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(secret: &str) -> JwtTokenProvider {
        JwtTokenProvider::new(secret.as_bytes(), Duration::minutes(30), Duration::days(7))
    }

    #[test]
    fn test_access_token_round_trip() {
        let jwt = provider("test-secret");
        let token = jwt.issue_access_token("alice").unwrap();
        let claims = jwt.validate_access(&token).unwrap();
        assert_eq!(claims.subject, "alice");
        assert_eq!(claims.token_type, TokenType::Access);
        assert!(claims.expires_at > Utc::now());
    }

    #[test]
    fn test_refresh_token_is_not_an_access_token() {
        let jwt = provider("test-secret");
        let token = jwt.issue_refresh_token("alice").unwrap();
        assert_eq!(jwt.validate(&token).unwrap().token_type, TokenType::Refresh);
        assert_eq!(
            jwt.validate_access(&token),
            Err(AuthError::WrongType("refresh"))
        );

        let mfa = jwt.issue_mfa_pending_token("alice").unwrap();
        assert_eq!(jwt.validate_access(&mfa), Err(AuthError::WrongType("mfa-pending")));
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = provider("test-secret");
        let token = jwt
            .issue("alice", TokenType::Access, Duration::seconds(-120))
            .unwrap();
        assert_eq!(jwt.validate_access(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let token = provider("secret-one").issue_access_token("alice").unwrap();
        assert_eq!(
            provider("secret-two").validate_access(&token),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_garbage_and_missing_tokens() {
        let jwt = provider("test-secret");
        assert_eq!(jwt.validate_access(""), Err(AuthError::Missing));
        assert!(matches!(
            jwt.validate_access("not-a-jwt"),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_short_secret_is_padded() {
        assert_eq!(pad_secret(b"abc").len(), MIN_SECRET_BYTES);
        assert_eq!(&pad_secret(b"abc")[..3], b"abc");
        assert_eq!(pad_secret(&[7u8; 40]).len(), 40);
    }

    #[test]
    fn test_missing_secret_generates_ephemeral_key() {
        let config = AuthConfig::default();
        let a = JwtTokenProvider::from_config(&config);
        let b = JwtTokenProvider::from_config(&config);
        let token = a.issue_access_token("alice").unwrap();
        assert!(a.validate_access(&token).is_ok());
        assert_eq!(b.validate_access(&token), Err(AuthError::InvalidSignature));
    }
}
