//! Certificate issuer interface.

use async_trait::async_trait;

use super::error::IssueFailure;

/// Key and certificates returned by a successful issuance
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub private_key_pem: String,
    pub certificate_pem: String,
    pub issuer_certificate_pem: String,
}

impl IssuedCertificate {
    /// Leaf certificate followed by the issuer chain, as nginx expects it
    pub fn chain_pem(&self) -> String {
        let mut chain = self.certificate_pem.clone();
        if !chain.ends_with('\n') {
            chain.push('\n');
        }
        chain.push_str(&self.issuer_certificate_pem);
        chain
    }
}

/// Something that can obtain a certificate covering a list of names
///
/// One call is one certificate request: either every name is covered by
/// the returned certificate or the call fails with the per-name reasons.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn obtain(&self, domains: &[String]) -> Result<IssuedCertificate, IssueFailure>;
}
