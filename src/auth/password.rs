//! Password hashing and constant-time verification.

use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use password_hash::{PasswordHash, SaltString};
use rand::rngs::OsRng;

/// Hash a password with Argon2id and a fresh random salt.
///
/// Two calls with the same input never produce the same PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC hash.
///
/// Returns `None` when no hash is stored: the account cannot authenticate by
/// password at all, which callers must not conflate with a wrong password.
/// A malformed stored hash verifies as `Some(false)`, never as an error.
#[must_use]
pub fn verify_password(password: &str, stored_hash: Option<&str>) -> Option<bool> {
    let stored = stored_hash?;
    let Ok(parsed) = PasswordHash::new(stored) else {
        return Some(false);
    };
    Some(
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() -> Result<()> {
        let hash = hash_password("correct horse battery staple")?;
        assert_eq!(
            verify_password("correct horse battery staple", Some(&hash)),
            Some(true)
        );
        Ok(())
    }

    #[test]
    fn wrong_password_fails() -> Result<()> {
        let hash = hash_password("correct horse battery staple")?;
        assert_eq!(
            verify_password("incorrect horse battery staple", Some(&hash)),
            Some(false)
        );
        Ok(())
    }

    #[test]
    fn salts_differ_between_calls() -> Result<()> {
        let first = hash_password("same input")?;
        let second = hash_password("same input")?;
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn absent_hash_is_not_a_failure() {
        assert_eq!(verify_password("anything", None), None);
    }

    #[test]
    fn malformed_hash_fails_closed() {
        assert_eq!(verify_password("anything", Some("not-a-phc-string")), Some(false));
        assert_eq!(verify_password("anything", Some("")), Some(false));
    }
}
