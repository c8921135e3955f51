//! Placeholder certificates
//!
//! nginx refuses to start when an `ssl_certificate` file it references is
//! missing. Before the first real certificate of a group is issued, a
//! self-signed pair is written in its place. It carries no subject
//! alternative names, so the validity check always reports it as a domain
//! mismatch and the real certificate is requested on the next pass.

use chrono::{Datelike, Utc};
use rcgen::{
    date_time_ymd, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    KeyPair, KeyUsagePurpose,
};
use tracing::debug;

use super::error::StorageError;

/// Years the placeholder stays valid
const PLACEHOLDER_VALIDITY_YEARS: i32 = 5;

/// A generated self-signed pair
#[derive(Debug, Clone)]
pub struct Placeholder {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate a self-signed certificate for nginx to start with
pub fn generate_placeholder(domain: &str) -> Result<Placeholder, StorageError> {
    let key_pair = KeyPair::generate().map_err(|e| StorageError::Placeholder(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "certwarden");
    dn.push(DnType::CommonName, "certwarden placeholder");
    params.distinguished_name = dn;

    let today = Utc::now().date_naive();
    let (month, day) = (today.month() as u8, today.day().min(28) as u8);
    params.not_before = date_time_ymd(today.year(), month, day);
    params.not_after = date_time_ymd(today.year() + PLACEHOLDER_VALIDITY_YEARS, month, day);

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| StorageError::Placeholder(e.to_string()))?;

    debug!(domain = %domain, "Generated placeholder certificate");

    Ok(Placeholder {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}
