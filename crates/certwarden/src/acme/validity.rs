//! Stored certificate validity checks
//!
//! A certificate is kept only while it is both far enough from expiry and
//! covers exactly the names currently configured for its group. Anything
//! else triggers a new request. A certificate that cannot be parsed is an
//! error rather than a reason to renew, so on-disk corruption surfaces
//! instead of being papered over.

use std::fs;
use std::path::Path;

use certwarden_config::domain_sort;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use super::error::ValidityError;

/// Outcome of checking a stored certificate against its group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    /// Keep the certificate
    Valid { not_after: DateTime<Utc> },
    /// Expires within the renewal window
    Expiring { not_after: DateTime<Utc> },
    /// Covers a different set of names than configured
    DomainMismatch {
        found: Vec<String>,
        expected: Vec<String>,
    },
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid { .. })
    }
}

/// The parts of a certificate the validity check looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub not_after: DateTime<Utc>,
    /// DNS subject alternative names, in canonical order
    pub dns_names: Vec<String>,
    /// DER encoded SubjectPublicKeyInfo
    pub public_key_der: Vec<u8>,
}

/// Parse the leaf (first PEM block) of a stored chain
pub fn parse_certificate(data: &[u8], path: &Path) -> Result<CertificateInfo, ValidityError> {
    let (_, pem) = parse_x509_pem(data).map_err(|e| ValidityError::Pem {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let cert = pem.parse_x509().map_err(|e| ValidityError::X509 {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let timestamp = cert.validity().not_after.timestamp();
    let not_after = DateTime::from_timestamp(timestamp, 0).ok_or_else(|| ValidityError::X509 {
        path: path.to_path_buf(),
        message: format!("not-after timestamp {timestamp} out of range"),
    })?;

    let san = cert
        .subject_alternative_name()
        .map_err(|e| ValidityError::X509 {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let mut dns_names: Vec<String> = san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    domain_sort(&mut dns_names);

    Ok(CertificateInfo {
        not_after,
        dns_names,
        public_key_der: cert.public_key().raw.to_vec(),
    })
}

/// Check the certificate at `path` for the group `domain`
///
/// `renew_before` is the window ahead of expiry in which the certificate
/// is already considered due.
pub fn check_certificate(
    path: &Path,
    domain: &str,
    expected: &[String],
    renew_before: Duration,
    now: DateTime<Utc>,
) -> Result<Validity, ValidityError> {
    let data = fs::read(path).map_err(|source| ValidityError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let info = parse_certificate(&data, path)?;

    let threshold = now + renew_before;
    if info.not_after < threshold {
        debug!(
            domain = %domain,
            expires = %info.not_after,
            threshold = %threshold,
            "Certificate needs renewal"
        );
        return Ok(Validity::Expiring {
            not_after: info.not_after,
        });
    }

    let mut expected = expected.to_vec();
    domain_sort(&mut expected);
    if info.dns_names != expected {
        debug!(
            domain = %domain,
            found = ?info.dns_names,
            expected = ?expected,
            "Certificate domains differ from configuration"
        );
        return Ok(Validity::DomainMismatch {
            found: info.dns_names,
            expected,
        });
    }

    let remaining = info.not_after - now;
    info!(
        domain = %domain,
        expires = %info.not_after,
        remaining_days = remaining.num_days(),
        "Certificate looks good"
    );

    Ok(Validity::Valid {
        not_after: info.not_after,
    })
}
