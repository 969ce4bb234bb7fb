//! Directory-backed authentication: service bind, search, per-entry bind.
//!
//! The decision flow is written against the narrow [`DirectoryLink`] trait;
//! production connects over LDAP with [`LdapDirectory`], tests script the
//! link. Every failure point maps to its own rejection reason so "user not
//! found" is never reported as "wrong password".

use async_trait::async_trait;
use ldap3::{ldap_escape, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

use super::config::DirectorySettings;
use super::error::AuthError;

// LDAP resultCode 49.
const RC_INVALID_CREDENTIALS: u32 = 49;

/// Attributes pulled from the matched directory entry.
#[derive(Debug, Clone)]
pub struct DirectoryProfile {
    pub username: String,
    pub mail: String,
    pub display_name: String,
}

/// One entry returned by a directory search.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
}

/// Outcome of a simple bind attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    InvalidCredentials,
}

/// Minimal directory operations the authentication flow needs.
#[async_trait]
pub trait DirectoryLink: Send {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<BindOutcome, AuthError>;

    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<DirectoryEntry>, AuthError>;
}

/// Authenticate `username`/`password` against the directory behind `link`.
///
/// Success requires: the service bind, a matching entry (first match wins
/// when the directory returns several), a case-insensitive username match
/// on that entry, a non-empty mail attribute, and the per-entry bind with
/// the supplied password.
#[instrument(skip(link, settings, password))]
pub async fn authenticate<L: DirectoryLink>(
    link: &mut L,
    settings: &DirectorySettings,
    username: &str,
    password: &str,
) -> Result<DirectoryProfile, AuthError> {
    let normalized = username.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(AuthError::InvalidCredential("empty username".to_string()));
    }

    match link
        .simple_bind(&settings.app_dn, settings.app_password.expose_secret())
        .await?
    {
        BindOutcome::Bound => {}
        BindOutcome::InvalidCredentials => {
            // The service account is deployment configuration, not caller input.
            return Err(AuthError::ConfigurationError(
                "directory service account bind failed".to_string(),
            ));
        }
    }

    let filter = search_filter(settings, &normalized);
    let attributes = vec![
        settings.attribute_for_username.clone(),
        settings.attribute_for_mail.clone(),
        "cn".to_string(),
    ];
    let entries = link
        .search(&settings.search_base, &filter, &attributes)
        .await?;
    let selected = select_entry(settings, &normalized, &entries)?;

    match link.simple_bind(&selected.dn, password).await? {
        BindOutcome::Bound => {}
        BindOutcome::InvalidCredentials => {
            return Err(AuthError::InvalidCredential(format!(
                "directory bind failed for {normalized}"
            )));
        }
    }

    Ok(selected.profile)
}

struct SelectedEntry {
    dn: String,
    profile: DirectoryProfile,
}

/// Pick and validate the entry for `username` out of the search results.
fn select_entry(
    settings: &DirectorySettings,
    normalized_username: &str,
    entries: &[DirectoryEntry],
) -> Result<SelectedEntry, AuthError> {
    let Some(entry) = entries.first() else {
        return Err(AuthError::UnknownSubject);
    };
    if entries.len() > 1 {
        debug!(
            count = entries.len(),
            "directory returned multiple matches; using the first"
        );
    }

    let entry_username = first_attribute(entry, &settings.attribute_for_username)
        .map(str::to_lowercase)
        .ok_or_else(|| {
            AuthError::InvalidCredential("directory entry has no username attribute".to_string())
        })?;
    if entry_username != normalized_username {
        return Err(AuthError::InvalidCredential(format!(
            "directory entry {entry_username} does not match requested username"
        )));
    }

    let mail = first_attribute(entry, &settings.attribute_for_mail)
        .filter(|mail| !mail.is_empty())
        .ok_or_else(|| {
            AuthError::InvalidCredential(format!(
                "directory entry for {normalized_username} has no mail attribute"
            ))
        })?
        .to_string();

    let display_name = first_attribute(entry, "cn")
        .map_or_else(|| entry_username.clone(), str::to_string);

    Ok(SelectedEntry {
        dn: entry.dn.clone(),
        profile: DirectoryProfile {
            username: entry_username,
            mail,
            display_name,
        },
    })
}

fn first_attribute<'a>(entry: &'a DirectoryEntry, name: &str) -> Option<&'a str> {
    entry
        .attributes
        .get(name)
        .and_then(|values| values.first())
        .map(String::as_str)
}

/// Build the escaped search filter for an already-normalized username.
fn search_filter(settings: &DirectorySettings, normalized_username: &str) -> String {
    format!(
        "(&({}={}){})",
        settings.attribute_for_username,
        ldap_escape(normalized_username),
        settings.search_filters
    )
}

/// LDAP-backed [`DirectoryLink`] over a TLS-validated connection.
#[derive(Debug)]
pub struct LdapDirectory {
    ldap: ldap3::Ldap,
}

impl LdapDirectory {
    /// Connect to the configured directory server.
    ///
    /// TLS deployments must name the CA bundle the server presents; refusing
    /// to start without one is a configuration fault, not an auth failure.
    pub async fn connect(
        settings: &DirectorySettings,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        if settings.use_tls {
            match &settings.ca_cert_file {
                Some(path) if !path.exists() => {
                    return Err(AuthError::ConfigurationError(format!(
                        "directory CA certificate not found: {}",
                        path.display()
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(AuthError::ConfigurationError(
                        "directory TLS enabled but no CA certificate configured".to_string(),
                    ));
                }
            }
        }

        let scheme = if settings.use_tls { "ldaps" } else { "ldap" };
        let default_port = if settings.use_tls { 636 } else { 389 };
        let url = format!(
            "{scheme}://{}:{}",
            settings.host,
            settings.port.unwrap_or(default_port)
        );
        let conn_settings = LdapConnSettings::new().set_conn_timeout(timeout);
        let (conn, ldap) = LdapConnAsync::with_settings(conn_settings, &url)
            .await
            .map_err(|err| {
                AuthError::ProviderUnavailable(format!("directory connection failed: {err}"))
            })?;
        ldap3::drive!(conn);
        Ok(Self { ldap })
    }
}

#[async_trait]
impl DirectoryLink for LdapDirectory {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<BindOutcome, AuthError> {
        let result = self.ldap.simple_bind(dn, password).await.map_err(|err| {
            AuthError::ProviderUnavailable(format!("directory bind failed: {err}"))
        })?;
        match result.rc {
            0 => Ok(BindOutcome::Bound),
            RC_INVALID_CREDENTIALS => Ok(BindOutcome::InvalidCredentials),
            rc => Err(AuthError::ProviderUnavailable(format!(
                "directory bind returned result code {rc}"
            ))),
        }
    }

    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<DirectoryEntry>, AuthError> {
        let (entries, _result) = self
            .ldap
            .search(base, Scope::Subtree, filter, attributes.to_vec())
            .await
            .map_err(|err| {
                AuthError::ProviderUnavailable(format!("directory search failed: {err}"))
            })?
            .success()
            .map_err(|err| {
                AuthError::ProviderUnavailable(format!("directory search rejected: {err}"))
            })?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let entry = SearchEntry::construct(entry);
                DirectoryEntry {
                    dn: entry.dn,
                    attributes: entry.attrs,
                }
            })
            .collect())
    }
}
