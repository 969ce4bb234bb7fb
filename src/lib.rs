//! # Identigi (Authentication Resolution Engine)
//!
//! `identigi` decides "who is this caller, and is their proof valid". It
//! arbitrates between several mutually exclusive credential schemes with a
//! strict precedence order and hands back a typed outcome:
//!
//! 1. **Trusted proxy header** — the upstream proxy already authenticated the
//!    caller; the asserted email is resolved (or provisioned) directly.
//! 2. **API key** — a `sk-`-prefixed opaque key looked up against the store.
//! 3. **Session token** — a compact signed token minted by this crate.
//! 4. **External bearer token** — a provider-issued token verified against
//!    the provider's published key set, with just-in-time provisioning.
//! 5. **Directory bind** — username/password checked against an LDAP
//!    directory, only reachable through the dedicated login operation.
//!
//! ## Collaborators
//!
//! The persistent user store is consumed through the [`store::UserStore`]
//! trait; the crate ships [`store::MemoryUserStore`] as a reference
//! implementation. The HTTP routing layer sits outside this crate and calls
//! [`Resolver::resolve`] with credentials extracted from request headers.
//!
//! ## Security posture
//!
//! Password verification is constant-time (Argon2id), session tokens are
//! symmetric JWS with a fixed algorithm per deployment, and provider tokens
//! are verified against a cached remote key set that tolerates provider
//! outages without treating them as rejections.

pub mod auth;
pub mod store;

pub use auth::config::{AuthConfig, DirectorySettings, ProviderSettings};
pub use auth::credential::{Credential, RequestCredentials, generate_api_key};
pub use auth::error::AuthError;
pub use auth::resolver::{LoginOutcome, Resolution, Resolver};
pub use auth::token::IssuedSession;
pub use store::{MemoryUserStore, User, UserRole, UserStore};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
