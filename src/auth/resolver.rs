//! Identity resolution: credential dispatch, lookup, and provisioning.
//!
//! Dispatch is a priority chain, not a fallback-on-error chain: the first
//! scheme that applies decides the outcome. The one deliberate exception is
//! token classification — a compact token whose header names a signing key
//! is provider-issued (local session tokens never name one) and is verified
//! as an external bearer token instead of failing as a bad session.

use regex::Regex;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::config::{AuthConfig, DirectorySettings};
use super::credential::{generate_api_key, Credential, RequestCredentials};
use super::directory::{self, DirectoryLink, DirectoryProfile, LdapDirectory};
use super::error::AuthError;
use super::password::{hash_password, verify_password};
use super::provider::{ExternalIdentityResolver, ProviderClaim};
use super::token::{IssuedSession, SessionTokenCodec};
use crate::store::{NewUser, StoreError, User, UserRole, UserStore, UserUpdate};

/// A successfully resolved identity.
///
/// `provisioned` is true when this very resolution created the local record
/// (just-in-time signup); re-fetching after a lost provisioning race counts
/// as resolving the existing record, not creating one.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub user: User,
    pub provisioned: bool,
}

/// Result of a login operation that also mints a session.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub resolution: Resolution,
    pub session: IssuedSession,
}

/// Resolves request credentials to local identities.
///
/// Holds no ambient global state: the configuration, the user store, and the
/// optional provider verifier are all injected.
pub struct Resolver {
    store: Arc<dyn UserStore>,
    config: AuthConfig,
    sessions: SessionTokenCodec,
    provider: Option<ExternalIdentityResolver>,
}

impl Resolver {
    /// Build a resolver from configuration and the user store collaborator.
    pub fn new(config: AuthConfig, store: Arc<dyn UserStore>) -> Result<Self, AuthError> {
        let provider = config
            .provider()
            .map(|settings| {
                ExternalIdentityResolver::new(
                    settings,
                    config.network_timeout(),
                    config.keyset_ttl(),
                )
            })
            .transpose()?;
        Ok(Self::with_provider(config, store, provider))
    }

    /// Build a resolver around a pre-built provider verifier (embedders that
    /// share a key set cache, and tests with scripted fetchers).
    #[must_use]
    pub fn with_provider(
        config: AuthConfig,
        store: Arc<dyn UserStore>,
        provider: Option<ExternalIdentityResolver>,
    ) -> Self {
        let sessions = SessionTokenCodec::new(config.session_secret().clone());
        Self {
            store,
            config,
            sessions,
            provider,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Resolve a request's credentials to an identity.
    ///
    /// Directory credentials are refused here; they are only accepted by the
    /// dedicated [`Resolver::login_directory`] operation.
    #[instrument(skip_all)]
    pub async fn resolve(
        &self,
        credentials: &RequestCredentials,
    ) -> Result<Resolution, AuthError> {
        match credentials.credential() {
            Some(Credential::TrustedHeader { email, name }) => {
                self.resolve_trusted(email, name).await
            }
            Some(Credential::ApiKey(key)) => {
                self.resolve_api_key(key, credentials.endpoint()).await
            }
            Some(Credential::SessionToken(token)) => self.resolve_token(token).await,
            Some(Credential::ExternalBearer(token)) => self.resolve_bearer(token).await,
            Some(Credential::Directory { .. }) => Err(AuthError::InvalidCredential(
                "directory credentials are only accepted by the directory login operation"
                    .to_string(),
            )),
            None => Err(AuthError::InvalidCredential(
                "no credentials presented".to_string(),
            )),
        }
    }

    /// The upstream proxy already authenticated the caller: resolve or
    /// provision by asserted email without any password check.
    async fn resolve_trusted(&self, email: &str, name: &str) -> Result<Resolution, AuthError> {
        let email = normalize_email(email);
        if let Some(user) = self.store.find_by_email(&email).await? {
            self.touch(user.id);
            return Ok(Resolution {
                user,
                provisioned: false,
            });
        }
        let (user, created) = self
            .provision(NewUser {
                email: Some(email),
                name: name.to_string(),
                ..Default::default()
            })
            .await?;
        Ok(Resolution {
            user,
            provisioned: created,
        })
    }

    async fn resolve_api_key(
        &self,
        key: &str,
        endpoint: Option<&str>,
    ) -> Result<Resolution, AuthError> {
        if !self.config.enable_api_keys() {
            return Err(AuthError::InvalidCredential(
                "API key authentication is disabled".to_string(),
            ));
        }
        if let Some(allowed) = self.config.api_key_allowed_endpoints() {
            let permitted =
                endpoint.is_some_and(|endpoint| allowed.iter().any(|entry| entry == endpoint));
            if !permitted {
                return Err(AuthError::InvalidCredential(
                    "endpoint is not allow-listed for API keys".to_string(),
                ));
            }
        }
        let Some(user) = self.store.find_by_api_key(key).await? else {
            return Err(AuthError::UnknownSubject);
        };
        self.touch(user.id);
        Ok(Resolution {
            user,
            provisioned: false,
        })
    }

    /// Session tokens and provider bearer tokens share the same wire shape.
    /// A key id in the header marks a provider-issued token; a kid-less
    /// token is verified as a local session and reported with the
    /// session-side reason when that fails.
    async fn resolve_token(&self, token: &str) -> Result<Resolution, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|_| AuthError::InvalidCredential("malformed token".to_string()))?;
        if header.kid.is_some() {
            return self.resolve_bearer(token).await;
        }

        let subject = self.sessions.verify(token)?;
        let Some(user) = self.store.find_by_id(subject).await? else {
            // The subject was deleted after the token was issued.
            return Err(AuthError::UnknownSubject);
        };
        self.touch(user.id);
        Ok(Resolution {
            user,
            provisioned: false,
        })
    }

    async fn resolve_bearer(&self, token: &str) -> Result<Resolution, AuthError> {
        let Some(provider) = &self.provider else {
            return Err(AuthError::InvalidCredential(
                "no external identity provider is configured".to_string(),
            ));
        };
        let claim = provider.verify_bearer(token).await?;
        self.resolve_claim(claim).await
    }

    /// Resolve a provider claim by email, provisioning when permitted and
    /// backfilling the provider subject on first external login.
    async fn resolve_claim(&self, claim: ProviderClaim) -> Result<Resolution, AuthError> {
        let email = claim
            .email
            .as_deref()
            .map(normalize_email)
            .filter(|email| !email.is_empty())
            .ok_or_else(|| {
                AuthError::InvalidCredential(
                    "external identity carries no email claim".to_string(),
                )
            })?;

        if let Some(user) = self.store.find_by_email(&email).await? {
            let user = if user.oauth_subject.is_none() {
                self.store
                    .update_fields(
                        user.id,
                        UserUpdate {
                            oauth_subject: Some(claim.subject.clone()),
                            ..Default::default()
                        },
                    )
                    .await?
                    .unwrap_or(user)
            } else {
                user
            };
            self.touch(user.id);
            return Ok(Resolution {
                user,
                provisioned: false,
            });
        }

        let (user, created) = self
            .provision(NewUser {
                email: Some(email),
                name: claim.name.clone(),
                oauth_subject: Some(claim.subject.clone()),
                ..Default::default()
            })
            .await?;
        Ok(Resolution {
            user,
            provisioned: created,
        })
    }

    /// Complete the provider's authorization-code flow: exchange the code,
    /// resolve or provision the claimed identity, and mint a session.
    pub async fn login_authorization_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let Some(provider) = &self.provider else {
            return Err(AuthError::ConfigurationError(
                "no external identity provider is configured".to_string(),
            ));
        };
        let claim = provider.exchange_code(code, redirect_uri).await?;
        let resolution = self.resolve_claim(claim).await?;
        let session = self.issue_session(resolution.user.id)?;
        Ok(LoginOutcome {
            resolution,
            session,
        })
    }

    /// Authenticate against the configured directory and mint a session.
    ///
    /// Only reachable through this dedicated operation, never through
    /// [`Resolver::resolve`].
    pub async fn login_directory(
        &self,
        username: &str,
        password: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let settings = self.directory_settings()?;
        let mut link = LdapDirectory::connect(settings, self.config.network_timeout()).await?;
        self.login_directory_via(&mut link, username, password)
            .await
    }

    /// Directory login over a caller-supplied link (tests, pooled
    /// connections).
    pub async fn login_directory_via<L: DirectoryLink>(
        &self,
        link: &mut L,
        username: &str,
        password: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let settings = self.directory_settings()?;
        let profile = directory::authenticate(link, settings, username, password).await?;
        let resolution = self.resolve_directory_profile(profile).await?;
        let session = self.issue_session(resolution.user.id)?;
        Ok(LoginOutcome {
            resolution,
            session,
        })
    }

    fn directory_settings(&self) -> Result<&DirectorySettings, AuthError> {
        if !self.config.enable_directory() {
            return Err(AuthError::InvalidCredential(
                "directory authentication is disabled".to_string(),
            ));
        }
        self.config.directory().ok_or_else(|| {
            AuthError::ConfigurationError(
                "directory authentication enabled but not configured".to_string(),
            )
        })
    }

    async fn resolve_directory_profile(
        &self,
        profile: DirectoryProfile,
    ) -> Result<Resolution, AuthError> {
        let email = normalize_email(&profile.mail);
        if let Some(user) = self.store.find_by_email(&email).await? {
            self.touch(user.id);
            return Ok(Resolution {
                user,
                provisioned: false,
            });
        }
        let (user, created) = self
            .provision(NewUser {
                email: Some(email),
                name: profile.display_name.clone(),
                ..Default::default()
            })
            .await?;
        Ok(Resolution {
            user,
            provisioned: created,
        })
    }

    /// Password sign-in; issues a session directly without flowing through
    /// [`Resolver::resolve`].
    pub async fn login_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let email = normalize_email(email);
        let Some(user) = self.store.find_by_email(&email).await? else {
            return Err(AuthError::InvalidCredential(
                "invalid email or password".to_string(),
            ));
        };
        match verify_password(password, user.password_hash.as_deref()) {
            Some(true) => {}
            Some(false) => {
                return Err(AuthError::InvalidCredential(
                    "invalid email or password".to_string(),
                ));
            }
            // No password on record: this account authenticates through an
            // external provider or the directory, not by password.
            None => {
                return Err(AuthError::InvalidCredential(
                    "password authentication is not available for this account".to_string(),
                ));
            }
        }
        self.touch(user.id);
        let session = self.issue_session(user.id)?;
        Ok(LoginOutcome {
            resolution: Resolution {
                user,
                provisioned: false,
            },
            session,
        })
    }

    /// Create a local account with a password and sign it in.
    pub async fn signup(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(AuthError::InvalidCredential(
                "invalid email format".to_string(),
            ));
        }
        if self.store.find_by_email(&email).await?.is_some() {
            return Err(AuthError::InvalidCredential(
                "email is already registered".to_string(),
            ));
        }
        let password_hash = hash_password(password).map_err(|err| {
            AuthError::ConfigurationError(format!("failed to hash password: {err}"))
        })?;
        let (user, created) = self
            .provision(NewUser {
                email: Some(email),
                name: name.to_string(),
                password_hash: Some(password_hash),
                ..Default::default()
            })
            .await?;
        if !created {
            // Lost a signup race for the same email.
            return Err(AuthError::InvalidCredential(
                "email is already registered".to_string(),
            ));
        }
        let session = self.issue_session(user.id)?;
        Ok(LoginOutcome {
            resolution: Resolution {
                user,
                provisioned: true,
            },
            session,
        })
    }

    /// Re-authenticate and replace the caller's password.
    ///
    /// Refused on trusted-header deployments, where the proxy owns identity.
    pub async fn update_password(
        &self,
        subject: Uuid,
        current: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        if self.config.trusted_email_header().is_some() {
            return Err(AuthError::InvalidCredential(
                "password updates are managed by the identity proxy".to_string(),
            ));
        }
        let Some(user) = self.store.find_by_id(subject).await? else {
            return Err(AuthError::UnknownSubject);
        };
        match verify_password(current, user.password_hash.as_deref()) {
            Some(true) => {}
            Some(false) => {
                return Err(AuthError::InvalidCredential(
                    "current password does not match".to_string(),
                ));
            }
            None => {
                return Err(AuthError::InvalidCredential(
                    "password authentication is not available for this account".to_string(),
                ));
            }
        }
        let password_hash = hash_password(new_password).map_err(|err| {
            AuthError::ConfigurationError(format!("failed to hash password: {err}"))
        })?;
        self.store
            .update_fields(
                user.id,
                UserUpdate {
                    password_hash: Some(password_hash),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Mint and store a fresh API key for `subject`.
    pub async fn create_api_key(&self, subject: Uuid) -> Result<String, AuthError> {
        if !self.config.enable_api_keys() {
            return Err(AuthError::InvalidCredential(
                "API key authentication is disabled".to_string(),
            ));
        }
        let key = generate_api_key();
        let updated = self
            .store
            .update_fields(
                subject,
                UserUpdate {
                    api_key: Some(Some(key.clone())),
                    ..Default::default()
                },
            )
            .await?;
        if updated.is_none() {
            return Err(AuthError::UnknownSubject);
        }
        Ok(key)
    }

    /// Remove the stored API key for `subject`.
    pub async fn revoke_api_key(&self, subject: Uuid) -> Result<(), AuthError> {
        let updated = self
            .store
            .update_fields(
                subject,
                UserUpdate {
                    api_key: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        if updated.is_none() {
            return Err(AuthError::UnknownSubject);
        }
        Ok(())
    }

    /// Issue a session token outside the resolution flow (e.g. right after
    /// a password signup that never goes through [`Resolver::resolve`]).
    pub fn issue_session(&self, subject: Uuid) -> Result<IssuedSession, AuthError> {
        self.sessions.issue(subject, self.config.session_ttl())
    }

    /// Verify a session token outside the resolution flow.
    pub fn verify_session(&self, token: &str) -> Result<Uuid, AuthError> {
        self.sessions.verify(token)
    }

    /// Insert a just-in-time identity: signup gate, first-user bootstrap,
    /// duplicate-email race recovery. The bool is true when this call
    /// actually created the record.
    async fn provision(&self, mut new_user: NewUser) -> Result<(User, bool), AuthError> {
        if !self.config.enable_signup() {
            return Err(AuthError::SignupDisabled);
        }
        new_user.role = self.bootstrap_role().await?;
        match self.store.insert(new_user.clone()).await {
            Ok(user) => {
                debug!(user_id = %user.id, role = %user.role, "provisioned identity");
                Ok((user, true))
            }
            Err(StoreError::DuplicateEmail(_)) => {
                // Lost a first-login race: the record exists now, use it.
                let email = new_user.email.as_deref().unwrap_or_default();
                let user = self.store.find_by_email(email).await?.ok_or_else(|| {
                    AuthError::ProviderUnavailable(
                        "identity vanished after duplicate-email conflict".to_string(),
                    )
                })?;
                Ok((user, false))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The very first identity in a fresh deployment gets the highest role;
    /// everyone after that gets the configured default.
    async fn bootstrap_role(&self) -> Result<UserRole, AuthError> {
        Ok(if self.store.count_users().await? == 0 {
            UserRole::Admin
        } else {
            self.config.default_role()
        })
    }

    /// Refresh the last-active timestamp off the decision path; failures are
    /// logged and never affect the resolution outcome.
    fn touch(&self, subject: Uuid) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.touch_last_active(subject).await {
                debug!(user_id = %subject, "failed to refresh last-active timestamp: {err}");
            }
        });
    }
}

/// Normalize an email for lookup and uniqueness checks.
fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email))
}
