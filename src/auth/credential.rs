//! Credential material extracted once per inbound request.

use http::header::{AUTHORIZATION, COOKIE};
use http::HeaderMap;
use uuid::Uuid;

use super::config::AuthConfig;

/// Fixed tag distinguishing API keys from session tokens at a glance.
pub const API_KEY_PREFIX: &str = "sk-";

/// Generate a new API key: the `sk-` tag plus opaque random material with no
/// embedded structure.
#[must_use]
pub fn generate_api_key() -> String {
    format!("{API_KEY_PREFIX}{}", Uuid::new_v4().simple())
}

/// Proof-of-identity material carried by one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Identity asserted by a trusted upstream proxy; bypasses password
    /// checks entirely.
    TrustedHeader { email: String, name: String },
    ApiKey(String),
    SessionToken(String),
    /// Bearer token issued by the external identity provider. Never produced
    /// by header extraction — the resolver reclassifies a
    /// [`Credential::SessionToken`] that turns out to be provider-issued.
    ExternalBearer(String),
    /// Only accepted by the dedicated directory login operation.
    Directory { username: String, password: String },
}

/// Everything the resolver needs from one request, extracted exactly once.
#[derive(Debug, Clone)]
pub struct RequestCredentials {
    credential: Option<Credential>,
    endpoint: Option<String>,
}

impl RequestCredentials {
    /// Extract credentials from request headers.
    ///
    /// Token material is taken from the session cookie first, then the
    /// `Authorization` header. A trusted-header assertion, when configured
    /// and present, outranks token material because the trusted-header
    /// scheme leads the dispatch order.
    #[must_use]
    pub fn from_headers(
        headers: &HeaderMap,
        endpoint: Option<&str>,
        config: &AuthConfig,
    ) -> Self {
        let credential = extract_trusted_assertion(headers, config)
            .or_else(|| extract_token(headers, config).map(classify_token));
        Self {
            credential,
            endpoint: endpoint.map(str::to_string),
        }
    }

    /// Wrap an already-classified credential (login forms, tests).
    #[must_use]
    pub fn direct(credential: Credential) -> Self {
        Self {
            credential: Some(credential),
            endpoint: None,
        }
    }

    #[must_use]
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

fn classify_token(token: String) -> Credential {
    if token.starts_with(API_KEY_PREFIX) {
        Credential::ApiKey(token)
    } else {
        Credential::SessionToken(token)
    }
}

fn extract_trusted_assertion(headers: &HeaderMap, config: &AuthConfig) -> Option<Credential> {
    let email_header = config.trusted_email_header()?;
    let email = header_value(headers, email_header)?.to_lowercase();
    let name = config
        .trusted_name_header()
        .and_then(|header| header_value(headers, header))
        .unwrap_or_else(|| email.clone());
    Some(Credential::TrustedHeader { email, name })
}

fn extract_token(headers: &HeaderMap, config: &AuthConfig) -> Option<String> {
    if let Some(token) = cookie_value(headers, config.session_cookie_name()) {
        return Some(token);
    }
    bearer_value(headers)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let Some((key, val)) = pair.trim().split_once('=') else {
            continue;
        };
        if key.trim() == cookie_name && !val.trim().is_empty() {
            return Some(val.trim().to_string());
        }
    }
    None
}

fn bearer_value(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use secrecy::SecretString;

    fn config() -> AuthConfig {
        AuthConfig::new(SecretString::from("test-secret"))
    }

    fn trusted_config() -> AuthConfig {
        config()
            .with_trusted_email_header(Some("x-forwarded-email".to_string()))
            .with_trusted_name_header(Some("x-forwarded-name".to_string()))
    }

    #[test]
    fn api_key_format() {
        let key = generate_api_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(key.len(), API_KEY_PREFIX.len() + 32);
        assert_ne!(generate_api_key(), generate_api_key());
    }

    #[test]
    fn cookie_beats_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("token=from-cookie"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        let credentials = RequestCredentials::from_headers(&headers, None, &config());
        assert_eq!(
            credentials.credential(),
            Some(&Credential::SessionToken("from-cookie".to_string()))
        );
    }

    #[test]
    fn bearer_token_extracted_when_no_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));

        let credentials = RequestCredentials::from_headers(&headers, Some("/api/chat"), &config());
        assert_eq!(
            credentials.credential(),
            Some(&Credential::SessionToken("abc123".to_string()))
        );
        assert_eq!(credentials.endpoint(), Some("/api/chat"));
    }

    #[test]
    fn sk_prefix_classifies_as_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-abc123"));

        let credentials = RequestCredentials::from_headers(&headers, None, &config());
        assert_eq!(
            credentials.credential(),
            Some(&Credential::ApiKey("sk-abc123".to_string()))
        );
    }

    #[test]
    fn trusted_assertion_outranks_token() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("token=from-cookie"));
        headers.insert(
            "x-forwarded-email",
            HeaderValue::from_static("Alice@Example.COM"),
        );
        headers.insert("x-forwarded-name", HeaderValue::from_static("Alice"));

        let credentials = RequestCredentials::from_headers(&headers, None, &trusted_config());
        assert_eq!(
            credentials.credential(),
            Some(&Credential::TrustedHeader {
                email: "alice@example.com".to_string(),
                name: "Alice".to_string(),
            })
        );
    }

    #[test]
    fn trusted_name_falls_back_to_email() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-email",
            HeaderValue::from_static("alice@example.com"),
        );

        let credentials = RequestCredentials::from_headers(&headers, None, &trusted_config());
        assert_eq!(
            credentials.credential(),
            Some(&Credential::TrustedHeader {
                email: "alice@example.com".to_string(),
                name: "alice@example.com".to_string(),
            })
        );
    }

    #[test]
    fn trusted_headers_ignored_when_not_configured() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-email",
            HeaderValue::from_static("mallory@example.com"),
        );

        let credentials = RequestCredentials::from_headers(&headers, None, &config());
        assert!(credentials.credential().is_none());
    }

    #[test]
    fn cookie_parsing_skips_flag_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("Secure; theme=dark; token=tok-1"),
        );

        let credentials = RequestCredentials::from_headers(&headers, None, &config());
        assert_eq!(
            credentials.credential(),
            Some(&Credential::SessionToken("tok-1".to_string()))
        );
    }

    #[test]
    fn empty_material_is_no_credential() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("token="));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));

        let credentials = RequestCredentials::from_headers(&headers, None, &config());
        assert!(credentials.credential().is_none());

        let credentials = RequestCredentials::from_headers(&HeaderMap::new(), None, &config());
        assert!(credentials.credential().is_none());
    }
}
