//! External identity provider: bearer verification and code exchange.
//!
//! Bearer tokens are verified offline against the provider's published key
//! set; the authorization-code flow exchanges the code out-of-band and then
//! reads the provider's profile endpoint. Both paths normalize to a
//! [`ProviderClaim`].

use jsonwebtoken::{decode, decode_header, Validation};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use super::config::ProviderSettings;
use super::error::AuthError;
use super::keyset::{HttpKeySetFetcher, KeySetError, RemoteKeySet};

/// Normalized identity assertion from a provider token or profile response.
#[derive(Debug, Clone)]
pub struct ProviderClaim {
    /// Opaque subject identifier assigned by the provider.
    pub subject: String,
    pub email: Option<String>,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct BearerClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
}

/// Validates provider-issued credentials for one configured tenant.
pub struct ExternalIdentityResolver {
    http: Client,
    keys: Arc<RemoteKeySet>,
    issuer: String,
    audience: String,
    client_id: String,
    client_secret: SecretString,
    token_url: Url,
    userinfo_url: Url,
}

impl ExternalIdentityResolver {
    /// Build a resolver whose key set is fetched from the provider's
    /// well-known endpoint.
    pub fn new(
        settings: &ProviderSettings,
        network_timeout: Duration,
        keyset_ttl: Duration,
    ) -> Result<Self, AuthError> {
        let http = build_client(network_timeout)?;
        let jwks_url = provider_url(&settings.domain, "/.well-known/jwks.json")?;
        let keys = Arc::new(RemoteKeySet::new(
            Arc::new(HttpKeySetFetcher::new(http.clone(), jwks_url)),
            keyset_ttl,
        ));
        Self::with_key_set(settings, http, keys)
    }

    /// Build a resolver over an existing key set cache (embedders that share
    /// one cache across resolvers, and tests with scripted fetchers).
    pub fn with_key_set(
        settings: &ProviderSettings,
        http: Client,
        keys: Arc<RemoteKeySet>,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            http,
            keys,
            issuer: format!("https://{}/", settings.domain),
            audience: settings.audience.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            token_url: provider_url(&settings.domain, "/oauth/token")?,
            userinfo_url: provider_url(&settings.domain, "/userinfo")?,
        })
    }

    /// Verify a provider-issued bearer token.
    ///
    /// The token header names the signing key; the key set cache resolves it,
    /// then signature, audience, issuer, and expiry are checked together.
    #[instrument(skip_all)]
    pub async fn verify_bearer(&self, token: &str) -> Result<ProviderClaim, AuthError> {
        let header = decode_header(token)
            .map_err(|_| AuthError::InvalidCredential("malformed bearer token".to_string()))?;
        let kid = header.kid.ok_or_else(|| {
            AuthError::InvalidCredential("no_matching_key: bearer token names no key".to_string())
        })?;

        let key = self.keys.resolve_key(&kid).await.map_err(|err| match err {
            KeySetError::NoMatchingKey { .. } => {
                AuthError::InvalidCredential(format!("no_matching_key: {err}"))
            }
            KeySetError::Unavailable(message) => AuthError::ProviderUnavailable(message),
        })?;

        let mut validation = Validation::new(key.algorithm);
        validation.leeway = 0;
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_issuer(&[self.issuer.as_str()]);

        let data = decode::<BearerClaims>(token, &key.decoding_key, &validation)
            .map_err(classify_verification_error)?;
        debug!(subject = %data.claims.sub, "verified provider bearer token");
        Ok(claim_from(
            data.claims.sub,
            data.claims.email,
            data.claims.nickname,
            data.claims.name,
        ))
    }

    /// Exchange an authorization code for an identity assertion.
    ///
    /// Two round trips: the code-for-token exchange, then the profile
    /// endpoint for the access token obtained.
    #[instrument(skip_all)]
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderClaim, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        let response = self
            .http
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|err| AuthError::ProviderUnavailable(format!("code exchange failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::InvalidCredential(format!(
                "code exchange rejected ({status}): {}",
                provider_error_message(&body)
            )));
        }
        let exchange: TokenExchangeResponse = response.json().await.map_err(|err| {
            AuthError::ProviderUnavailable(format!("malformed token response: {err}"))
        })?;

        let response = self
            .http
            .get(self.userinfo_url.clone())
            .bearer_auth(&exchange.access_token)
            .send()
            .await
            .map_err(|err| {
                AuthError::ProviderUnavailable(format!("profile fetch failed: {err}"))
            })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::InvalidCredential(format!(
                "profile fetch rejected ({status}): {}",
                provider_error_message(&body)
            )));
        }
        let profile: UserInfo = response.json().await.map_err(|err| {
            AuthError::ProviderUnavailable(format!("malformed profile response: {err}"))
        })?;
        Ok(claim_from(
            profile.sub,
            profile.email,
            profile.nickname,
            profile.name,
        ))
    }
}

fn build_client(network_timeout: Duration) -> Result<Client, AuthError> {
    Client::builder()
        .user_agent(crate::APP_USER_AGENT)
        .timeout(network_timeout)
        .build()
        .map_err(|err| AuthError::ConfigurationError(format!("failed to build HTTP client: {err}")))
}

fn provider_url(domain: &str, path: &str) -> Result<Url, AuthError> {
    Url::parse(&format!("https://{domain}{path}"))
        .map_err(|err| AuthError::ConfigurationError(format!("invalid provider domain: {err}")))
}

/// The display name falls back from nickname to name to the subject itself.
fn claim_from(
    subject: String,
    email: Option<String>,
    nickname: Option<String>,
    name: Option<String>,
) -> ProviderClaim {
    let display_name = nickname
        .or(name)
        .unwrap_or_else(|| subject.clone());
    ProviderClaim {
        subject,
        email,
        name: display_name,
    }
}

fn classify_verification_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::ExpiredCredential,
        ErrorKind::InvalidAudience | ErrorKind::InvalidIssuer => {
            AuthError::InvalidCredential("bad_audience_or_issuer".to_string())
        }
        ErrorKind::InvalidSignature => AuthError::InvalidCredential("bad_signature".to_string()),
        _ => AuthError::InvalidCredential(format!("bearer token failed verification: {err}")),
    }
}

/// Pull the human-readable message out of a provider error body, falling
/// back to the raw body so diagnostics are never lost.
fn provider_error_message(body: &str) -> String {
    serde_json::from_str::<ProviderErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error_description.or(parsed.error))
        .unwrap_or_else(|| body.to_string())
}
