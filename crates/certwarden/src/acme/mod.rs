//! ACME certificate management
//!
//! Obtains and renews one certificate per registrable domain from Let's
//! Encrypt or a compatible CA.
//!
//! # Architecture
//!
//! - [`AcmeClient`] - Wrapper around `instant-acme`, implements [`CertificateIssuer`]
//! - [`AcquisitionDriver`] - Decides per group whether a new certificate is needed
//! - [`CertificateStorage`] - Certificates, keys and placeholders on disk
//! - [`AccountStore`] - The persisted account identity
//! - [`ChallengeManager`] / [`ChallengeServer`] - Pending HTTP-01 challenges and the listener serving them
//!
//! # Challenge Flow
//!
//! 1. [`AcmeClient`] creates one order covering every name of the group
//! 2. For each name, the ACME server provides a challenge token
//! 3. [`ChallengeManager`] registers the token and key authorization
//! 4. nginx forwards `/.well-known/acme-challenge/<token>` to [`ChallengeServer`]
//! 5. Once validated, [`AcmeClient`] finalizes the order with a fresh key
//! 6. [`CertificateStorage`] replaces the key and then the chain atomically

mod account;
mod challenge;
mod client;
mod driver;
mod error;
mod issuer;
mod selfsigned;
mod storage;
mod validity;

pub use account::{AccountIdentity, AccountStore, Registration};
pub use challenge::{ChallengeManager, ChallengeServer, ACME_CHALLENGE_PREFIX};
pub use client::{split_chain, AcmeClient, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
pub use driver::{AcquisitionDriver, DEFAULT_RENEW_BEFORE_HOURS};
pub use error::{AccountError, AcmeError, AcquireError, IssueFailure, StorageError, ValidityError};
pub use issuer::{CertificateIssuer, IssuedCertificate};
pub use selfsigned::{generate_placeholder, Placeholder};
pub use storage::{CertificateStorage, StoredPair};
pub use validity::{check_certificate, parse_certificate, CertificateInfo, Validity};
