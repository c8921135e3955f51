//! Per-group certificate acquisition
//!
//! Checks the stored certificate of one registrable domain and, when it is
//! missing, due for renewal or covering the wrong names, requests a
//! replacement for the whole group in a single order.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info};

use super::error::AcquireError;
use super::issuer::CertificateIssuer;
use super::storage::CertificateStorage;
use super::validity::{check_certificate, Validity};

/// Default renewal window ahead of expiry (15 days)
pub const DEFAULT_RENEW_BEFORE_HOURS: u64 = 360;

/// Drives issuance for domain groups
pub struct AcquisitionDriver {
    issuer: Arc<dyn CertificateIssuer>,
    storage: Arc<CertificateStorage>,
    renew_before: Duration,
}

impl AcquisitionDriver {
    pub fn new(issuer: Arc<dyn CertificateIssuer>, storage: Arc<CertificateStorage>) -> Self {
        Self {
            issuer,
            storage,
            renew_before: Duration::hours(DEFAULT_RENEW_BEFORE_HOURS as i64),
        }
    }

    /// Set the renewal window
    pub fn with_renew_before(mut self, renew_before: Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    pub fn storage(&self) -> &Arc<CertificateStorage> {
        &self.storage
    }

    /// Make sure `domain` has a valid certificate covering exactly `names`
    ///
    /// Returns `true` when a new certificate was written. On issuance
    /// failure the stored pair is left as it was.
    pub async fn ensure_certificate(
        &self,
        domain: &str,
        names: &[String],
    ) -> Result<bool, AcquireError> {
        if self.storage.has_certificate(domain) {
            let validity = check_certificate(
                &self.storage.certificate_path(domain),
                domain,
                names,
                self.renew_before,
                Utc::now(),
            )?;

            match validity {
                Validity::Valid { .. } => return Ok(false),
                Validity::Expiring { not_after } => {
                    info!(domain = %domain, expires = %not_after, "Certificate due for renewal");
                }
                Validity::DomainMismatch { found, expected } => {
                    info!(
                        domain = %domain,
                        found = ?found,
                        expected = ?expected,
                        "Certificate domains changed, requesting new certificate"
                    );
                }
            }
        } else {
            info!(domain = %domain, "No certificate stored, requesting one");
        }

        let issued = match self.issuer.obtain(names).await {
            Ok(issued) => issued,
            Err(failure) => {
                for (name, reason) in &failure.failures {
                    error!(domain = %name, group = %domain, reason = %reason, "Certificate issuance failed");
                }
                return Err(failure.into());
            }
        };

        self.storage
            .save_certificate(domain, &issued.private_key_pem, &issued.chain_pem())?;

        info!(domain = %domain, names = ?names, "Wrote new certificate");
        Ok(true)
    }
}

impl std::fmt::Debug for AcquisitionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionDriver")
            .field("storage", &self.storage.base_path())
            .field("renew_before_hours", &self.renew_before.num_hours())
            .finish()
    }
}
