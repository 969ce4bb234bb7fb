//! Typed rejection and fault kinds for credential resolution.

use thiserror::Error;

use crate::store::StoreError;

/// Why a resolution attempt did not produce an identity.
///
/// Every code path in the resolver returns one of these; no panic or opaque
/// error escapes. Partial failures in multi-step flows carry the most
/// specific applicable reason, never a generic "authentication failed".
#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed or unverifiable proof of identity.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Well-formed proof whose validity window has passed.
    #[error("credential expired")]
    ExpiredCredential,

    /// Well-formed proof with no matching identity behind it.
    #[error("unknown subject")]
    UnknownSubject,

    /// A remote dependency (identity provider, directory, user store) could
    /// not be reached. The credential itself may still be valid, so this
    /// must never be cached or reported as a permanent rejection.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provisioning was required but signup is disabled.
    #[error("signup is disabled")]
    SignupDisabled,

    /// The deployment configuration rules out this operation.
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

impl AuthError {
    /// Server-side faults map to 5xx responses; everything else is on the
    /// caller.
    #[must_use]
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::ConfigurationError(_)
        )
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            // Duplicate-email races are resolved by re-fetching at the call
            // site; reaching this conversion means the email was genuinely
            // taken (explicit signup), not a race.
            StoreError::DuplicateEmail(_) => {
                Self::InvalidCredential("email is already registered".to_string())
            }
            StoreError::Unavailable(msg) => Self::ProviderUnavailable(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_faults_are_distinguished() {
        assert!(AuthError::ProviderUnavailable("down".to_string()).is_server_fault());
        assert!(AuthError::ConfigurationError("no cert".to_string()).is_server_fault());
        assert!(!AuthError::InvalidCredential("bad".to_string()).is_server_fault());
        assert!(!AuthError::ExpiredCredential.is_server_fault());
        assert!(!AuthError::UnknownSubject.is_server_fault());
        assert!(!AuthError::SignupDisabled.is_server_fault());
    }

    #[test]
    fn store_errors_convert() {
        let err: AuthError = StoreError::Unavailable("connection refused".to_string()).into();
        assert!(matches!(err, AuthError::ProviderUnavailable(_)));

        let err: AuthError = StoreError::DuplicateEmail("a@example.com".to_string()).into();
        assert!(matches!(err, AuthError::InvalidCredential(_)));
    }
}
