//! Authentication resolution: credential schemes, verification, dispatch.
//!
//! The entry point is [`resolver::Resolver`], which owns the session token
//! codec and the optional external-provider verifier and dispatches extracted
//! [`credential::Credential`]s in strict precedence order. The leaf modules
//! are independently usable: [`password`] for hashing, [`token`] for session
//! tokens, [`keyset`] for the remote signing-key cache, [`provider`] for
//! bearer verification and code exchange, and [`directory`] for LDAP binds.

pub mod config;
pub mod credential;
pub mod directory;
pub mod error;
pub mod keyset;
pub mod password;
pub mod provider;
pub mod resolver;
pub mod token;
