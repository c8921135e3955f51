//! ACME error types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors talking to the ACME server
#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("Account error: {0}")]
    Account(String),

    #[error("Failed to create order: {0}")]
    OrderCreation(String),

    #[error("Challenge error: {0}")]
    Challenge(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Failed to finalize order: {0}")]
    Finalize(String),

    #[error("Invalid certificate chain: {0}")]
    Chain(String),
}

/// Errors reading or writing the certificate store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to generate placeholder certificate: {0}")]
    Placeholder(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors loading or saving the account identity
#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Failed to read account file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Account file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize account: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to write account file: {0}")]
    Write(#[from] StorageError),

    #[error("An email address is required to register a new ACME account")]
    MissingEmail,
}

/// Errors parsing a stored certificate
#[derive(Error, Debug)]
pub enum ValidityError {
    #[error("Failed to read certificate {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse certificate PEM {path:?}: {message}")]
    Pem { path: PathBuf, message: String },

    #[error("Invalid X509 certificate {path:?}: {message}")]
    X509 { path: PathBuf, message: String },
}

/// Per-domain failures reported by an issuance attempt
///
/// A certificate covers the whole group, so any entry here means nothing
/// was issued for any domain of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueFailure {
    pub failures: BTreeMap<String, String>,
}

impl IssueFailure {
    /// Attribute the same failure to every requested domain
    pub fn for_all(domains: &[String], reason: impl fmt::Display) -> Self {
        let reason = reason.to_string();
        Self {
            failures: domains
                .iter()
                .map(|d| (d.clone(), reason.clone()))
                .collect(),
        }
    }
}

impl fmt::Display for IssueFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "issuance failed for {} domain(s): ", self.failures.len())?;
        let mut first = true;
        for (domain, reason) in &self.failures {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{domain}: {reason}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for IssueFailure {}

/// Errors from a single group's acquisition
#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("Stored certificate is unusable: {0}")]
    Corrupt(#[from] ValidityError),

    #[error(transparent)]
    Issuance(#[from] IssueFailure),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_failure_for_all() {
        let domains = vec!["a.example.com".to_string(), "b.example.com".to_string()];
        let failure = IssueFailure::for_all(&domains, "order rejected");

        assert_eq!(failure.failures.len(), 2);
        assert_eq!(failure.failures["a.example.com"], "order rejected");
    }

    #[test]
    fn test_issue_failure_display_lists_domains() {
        let mut failure = IssueFailure::default();
        failure
            .failures
            .insert("b.example.com".to_string(), "unauthorized".to_string());
        failure
            .failures
            .insert("a.example.com".to_string(), "dns".to_string());

        assert_eq!(
            failure.to_string(),
            "issuance failed for 2 domain(s): a.example.com: dns; b.example.com: unauthorized"
        );
    }
}
