//! Resolver configuration and the session TTL expression grammar.

use chrono::Duration;
use regex::Regex;
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use super::error::AuthError;
use crate::store::UserRole;

const DEFAULT_NETWORK_TIMEOUT: StdDuration = StdDuration::from_secs(5);
const DEFAULT_KEYSET_TTL: StdDuration = StdDuration::from_secs(300);
const DEFAULT_SESSION_COOKIE_NAME: &str = "token";

/// External identity provider connection parameters.
#[derive(Clone)]
pub struct ProviderSettings {
    /// Provider tenant domain, e.g. `tenant.example-idp.com`.
    pub domain: String,
    /// Expected `aud` claim on bearer tokens.
    pub audience: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

/// Directory (LDAP) connection parameters.
#[derive(Clone)]
pub struct DirectorySettings {
    pub host: String,
    /// Defaults to 636 with TLS, 389 without.
    pub port: Option<u16>,
    pub attribute_for_username: String,
    pub attribute_for_mail: String,
    /// Service account used for the search bind.
    pub app_dn: String,
    pub app_password: SecretString,
    pub search_base: String,
    /// Extra filter clauses appended to the username match.
    pub search_filters: String,
    pub use_tls: bool,
    pub ca_cert_file: Option<PathBuf>,
}

impl DirectorySettings {
    #[must_use]
    pub fn new(host: String, app_dn: String, app_password: SecretString, search_base: String) -> Self {
        Self {
            host,
            port: None,
            attribute_for_username: "uid".to_string(),
            attribute_for_mail: "mail".to_string(),
            app_dn,
            app_password,
            search_base,
            search_filters: String::new(),
            use_tls: true,
            ca_cert_file: None,
        }
    }
}

/// Deployment-wide knobs for the resolver.
///
/// Constructed by the configuration collaborator and handed to
/// [`crate::Resolver::new`]; the resolver never reads ambient global state.
#[derive(Clone)]
pub struct AuthConfig {
    session_secret: SecretString,
    session_ttl: Option<Duration>,
    session_cookie_name: String,
    enable_signup: bool,
    enable_api_keys: bool,
    /// `None` means API keys work on every endpoint.
    api_key_allowed_endpoints: Option<Vec<String>>,
    enable_directory: bool,
    trusted_email_header: Option<String>,
    trusted_name_header: Option<String>,
    default_role: UserRole,
    provider: Option<ProviderSettings>,
    directory: Option<DirectorySettings>,
    network_timeout: StdDuration,
    keyset_ttl: StdDuration,
}

impl AuthConfig {
    #[must_use]
    pub fn new(session_secret: SecretString) -> Self {
        Self {
            session_secret,
            session_ttl: None,
            session_cookie_name: DEFAULT_SESSION_COOKIE_NAME.to_string(),
            enable_signup: true,
            enable_api_keys: false,
            api_key_allowed_endpoints: None,
            enable_directory: false,
            trusted_email_header: None,
            trusted_name_header: None,
            default_role: UserRole::Pending,
            provider: None,
            directory: None,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            keyset_ttl: DEFAULT_KEYSET_TTL,
        }
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_session_cookie_name(mut self, name: String) -> Self {
        self.session_cookie_name = name;
        self
    }

    #[must_use]
    pub fn with_signup_enabled(mut self, enabled: bool) -> Self {
        self.enable_signup = enabled;
        self
    }

    #[must_use]
    pub fn with_api_keys_enabled(mut self, enabled: bool) -> Self {
        self.enable_api_keys = enabled;
        self
    }

    #[must_use]
    pub fn with_api_key_allowed_endpoints(mut self, endpoints: Option<Vec<String>>) -> Self {
        self.api_key_allowed_endpoints = endpoints;
        self
    }

    #[must_use]
    pub fn with_directory_enabled(mut self, enabled: bool) -> Self {
        self.enable_directory = enabled;
        self
    }

    #[must_use]
    pub fn with_trusted_email_header(mut self, header: Option<String>) -> Self {
        self.trusted_email_header = header;
        self
    }

    #[must_use]
    pub fn with_trusted_name_header(mut self, header: Option<String>) -> Self {
        self.trusted_name_header = header;
        self
    }

    #[must_use]
    pub fn with_default_role(mut self, role: UserRole) -> Self {
        self.default_role = role;
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: ProviderSettings) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_directory(mut self, directory: DirectorySettings) -> Self {
        self.directory = Some(directory);
        self
    }

    #[must_use]
    pub fn with_network_timeout(mut self, timeout: StdDuration) -> Self {
        self.network_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keyset_ttl(mut self, ttl: StdDuration) -> Self {
        self.keyset_ttl = ttl;
        self
    }

    pub(crate) fn session_secret(&self) -> &SecretString {
        &self.session_secret
    }

    #[must_use]
    pub fn session_ttl(&self) -> Option<Duration> {
        self.session_ttl
    }

    #[must_use]
    pub fn session_cookie_name(&self) -> &str {
        &self.session_cookie_name
    }

    #[must_use]
    pub fn enable_signup(&self) -> bool {
        self.enable_signup
    }

    #[must_use]
    pub fn enable_api_keys(&self) -> bool {
        self.enable_api_keys
    }

    #[must_use]
    pub fn api_key_allowed_endpoints(&self) -> Option<&[String]> {
        self.api_key_allowed_endpoints.as_deref()
    }

    #[must_use]
    pub fn enable_directory(&self) -> bool {
        self.enable_directory
    }

    #[must_use]
    pub fn trusted_email_header(&self) -> Option<&str> {
        self.trusted_email_header.as_deref()
    }

    #[must_use]
    pub fn trusted_name_header(&self) -> Option<&str> {
        self.trusted_name_header.as_deref()
    }

    #[must_use]
    pub fn default_role(&self) -> UserRole {
        self.default_role
    }

    #[must_use]
    pub fn provider(&self) -> Option<&ProviderSettings> {
        self.provider.as_ref()
    }

    #[must_use]
    pub fn directory(&self) -> Option<&DirectorySettings> {
        self.directory.as_ref()
    }

    #[must_use]
    pub fn network_timeout(&self) -> StdDuration {
        self.network_timeout
    }

    #[must_use]
    pub fn keyset_ttl(&self) -> StdDuration {
        self.keyset_ttl
    }
}

/// Parse a session TTL expression: `30d`, `12h`, `90m`, `45s`, `500ms`, `2w`.
///
/// `-1` and `0` mean sessions never expire, as does any non-positive value.
pub fn parse_ttl(expr: &str) -> Result<Option<Duration>, AuthError> {
    let pattern = Regex::new(r"^(-1|0|(-?\d+(\.\d+)?)(ms|s|m|h|d|w))$")
        .map_err(|err| AuthError::ConfigurationError(format!("invalid TTL pattern: {err}")))?;
    let captures = pattern.captures(expr.trim()).ok_or_else(|| {
        AuthError::ConfigurationError(format!("invalid session TTL expression: {expr}"))
    })?;

    let Some(value) = captures.get(2) else {
        // Bare "-1" or "0".
        return Ok(None);
    };
    let value: f64 = value.as_str().parse().map_err(|err| {
        AuthError::ConfigurationError(format!("invalid session TTL value: {err}"))
    })?;
    if value <= 0.0 {
        return Ok(None);
    }

    let unit_ms = match captures.get(4).map(|unit| unit.as_str()) {
        Some("ms") => 1.0,
        Some("s") => 1_000.0,
        Some("m") => 60_000.0,
        Some("h") => 3_600_000.0,
        Some("d") => 86_400_000.0,
        Some("w") => 604_800_000.0,
        _ => {
            return Err(AuthError::ConfigurationError(format!(
                "invalid session TTL unit in: {expr}"
            )))
        }
    };

    #[allow(clippy::cast_possible_truncation)]
    let millis = (value * unit_ms) as i64;
    Ok(Some(Duration::milliseconds(millis)))
}
