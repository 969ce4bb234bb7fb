//! Compact session token issuance and verification.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::AuthError;

// Fixed for the lifetime of a deployment; changing it invalidates every
// outstanding session token.
const ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: Uuid,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// A freshly minted session token plus its absolute expiry, if any.
///
/// The token is a single self-contained string safe to embed in a cookie
/// value or an `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Signs and verifies session tokens with a process-wide symmetric secret.
pub struct SessionTokenCodec {
    secret: SecretString,
}

impl SessionTokenCodec {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    /// Issue a token for `subject`. Without a TTL the token never expires.
    pub fn issue(
        &self,
        subject: Uuid,
        ttl: Option<Duration>,
    ) -> Result<IssuedSession, AuthError> {
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let claims = SessionClaims {
            sub: subject,
            iat: now.timestamp(),
            exp: expires_at.map(|at| at.timestamp()),
        };
        let key = EncodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let token = encode(&Header::new(ALGORITHM), &claims, &key).map_err(|err| {
            AuthError::ConfigurationError(format!("failed to sign session token: {err}"))
        })?;
        Ok(IssuedSession { token, expires_at })
    }

    /// Verify a token and return its subject.
    ///
    /// A token carrying an `exp` is rejected after that instant regardless of
    /// signature validity; one without an `exp` never expires. Malformed
    /// input is a rejection, never a panic.
    pub fn verify(&self, token: &str) -> Result<Uuid, AuthError> {
        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        // exp stays optional: tokens without one are valid forever.
        validation.required_spec_claims.clear();
        match decode::<SessionClaims>(token, &key, &validation) {
            Ok(data) => Ok(data.claims.sub),
            Err(err) => match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Err(AuthError::ExpiredCredential)
                }
                _ => Err(AuthError::InvalidCredential(
                    "session token failed verification".to_string(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SessionTokenCodec {
        SessionTokenCodec::new(SecretString::from("unit-test-secret"))
    }

    #[test]
    fn issue_and_verify_round_trip() -> anyhow::Result<()> {
        let codec = codec();
        let subject = Uuid::new_v4();
        let session = codec.issue(subject, Some(Duration::hours(1)))?;
        assert!(session.expires_at.is_some());
        assert_eq!(codec.verify(&session.token)?, subject);
        Ok(())
    }

    #[test]
    fn token_without_ttl_never_expires() -> anyhow::Result<()> {
        let codec = codec();
        let subject = Uuid::new_v4();
        let session = codec.issue(subject, None)?;
        assert!(session.expires_at.is_none());
        assert_eq!(codec.verify(&session.token)?, subject);
        Ok(())
    }

    #[test]
    fn expired_token_is_rejected_as_expired() -> anyhow::Result<()> {
        let codec = codec();
        let session = codec.issue(Uuid::new_v4(), Some(Duration::hours(-1)))?;
        let err = codec.verify(&session.token).unwrap_err();
        assert!(matches!(err, AuthError::ExpiredCredential));
        Ok(())
    }

    #[test]
    fn foreign_secret_is_rejected() -> anyhow::Result<()> {
        let ours = codec();
        let theirs = SessionTokenCodec::new(SecretString::from("some-other-secret"));
        let session = theirs.issue(Uuid::new_v4(), None)?;
        let err = ours.verify(&session.token).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential(_)));
        Ok(())
    }

    #[test]
    fn malformed_tokens_are_rejected_not_panicked() {
        let codec = codec();
        for garbage in ["", "not-a-token", "a.b", "a.b.c.d", "🦀🦀🦀"] {
            assert!(matches!(
                codec.verify(garbage),
                Err(AuthError::InvalidCredential(_))
            ));
        }
    }

    #[test]
    fn tampered_payload_is_rejected() -> anyhow::Result<()> {
        let codec = codec();
        let session = codec.issue(Uuid::new_v4(), None)?;
        let mut parts: Vec<String> = session.token.split('.').map(str::to_string).collect();
        parts[1] = format!("{}AA", parts[1]);
        let tampered = parts.join(".");
        assert!(codec.verify(&tampered).is_err());
        Ok(())
    }
}
