//! ACME account identity
//!
//! The identity is created once and reused for the lifetime of the storage
//! directory. Registration (including agreement to the CA's terms of
//! service) happens on first start; the resulting account credentials,
//! which hold the account key pair, are persisted next to the contact
//! email so later starts never register again.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::error::AccountError;
use super::storage::write_file_atomic;

/// Account registration with one ACME directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registration {
    /// Account URL returned by the ACME server
    pub account_url: String,
    /// Directory the account was registered with
    pub directory_url: String,
    /// When registration and terms agreement completed
    pub registered_at: DateTime<Utc>,
    /// Serialized `instant_acme::AccountCredentials` (includes the key)
    pub credentials: serde_json::Value,
}

/// ACME account identity
///
/// There is no separate key file. The account key pair is generated by
/// `instant-acme` when the account is registered and is persisted inside
/// [`Registration::credentials`], so a freshly created identity holds only
/// the contact email until [`AcmeClient::connect`](super::AcmeClient::connect)
/// registers it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountIdentity {
    /// Contact email
    #[serde(default)]
    pub email: Option<String>,
    /// `None` until the first successful registration
    #[serde(default)]
    pub registration: Option<Registration>,
}

impl AccountIdentity {
    /// Whether this identity holds an account for `directory_url`
    pub fn is_registered_with(&self, directory_url: &str) -> bool {
        self.registration
            .as_ref()
            .is_some_and(|r| r.directory_url == directory_url)
    }
}

/// Loads and persists the account identity file
#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored identity, or start a fresh unregistered one
    ///
    /// # Errors
    ///
    /// An existing file that cannot be read or parsed is an error; the
    /// account is never silently replaced.
    pub fn load_or_create(&self, email: Option<&str>) -> Result<AccountIdentity, AccountError> {
        if !self.path.exists() {
            trace!(path = %self.path.display(), "No stored ACME account found");
            return Ok(AccountIdentity {
                email: email.map(str::to_string),
                registration: None,
            });
        }

        let content = fs::read_to_string(&self.path).map_err(|source| AccountError::Read {
            path: self.path.clone(),
            source,
        })?;
        let mut identity: AccountIdentity =
            serde_json::from_str(&content).map_err(|source| AccountError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        match (identity.email.as_deref(), email) {
            (None, Some(configured)) => identity.email = Some(configured.to_string()),
            (Some(stored), Some(configured)) if stored != configured => {
                warn!(
                    stored = %stored,
                    configured = %configured,
                    "Configured email differs from the registered account, keeping the registered one"
                );
            }
            _ => {}
        }

        debug!(
            email = ?identity.email,
            registered = identity.registration.is_some(),
            "Loaded ACME account"
        );
        Ok(identity)
    }

    /// Persist the identity with owner-only permissions
    pub fn save(&self, identity: &AccountIdentity) -> Result<(), AccountError> {
        let content = serde_json::to_vec_pretty(identity).map_err(AccountError::Serialize)?;
        write_file_atomic(&self.path, &content, true)?;

        info!(
            email = ?identity.email,
            path = %self.path.display(),
            "Saved ACME account"
        );
        Ok(())
    }
}
