//! Certificate and account storage
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── registration.json     # ACME account identity
//! └── certs/
//!     ├── example.com.key   # Private key
//!     └── example.com.pem   # Leaf certificate followed by the issuer chain
//! ```
//!
//! nginx is pointed at the `certs/` files directly, so every write here is
//! visible to the proxy on its next reload. Files are replaced by writing a
//! temporary sibling, syncing it and renaming it over the target; the key
//! of a pair is always replaced before its certificate.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rcgen::{KeyPair, PublicKeyData};
use tracing::{debug, info, trace, warn};

use super::error::StorageError;
use super::selfsigned;
use super::validity::parse_certificate;

/// What is stored for a registrable domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredPair {
    /// The key or the certificate is missing
    Absent,
    /// The key does not belong to the certificate
    Mismatched,
    Present,
}

/// Certificate storage manager
#[derive(Debug)]
pub struct CertificateStorage {
    /// Base storage directory
    base_path: PathBuf,
}

impl CertificateStorage {
    /// Create a new certificate storage at the given path
    ///
    /// Creates the directory structure if it doesn't exist and sets
    /// restrictive permissions (0700 on Unix) on the base directory.
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(base_path).map_err(|e| StorageError::io(base_path, e))?;

        let certs_path = base_path.join("certs");
        fs::create_dir_all(&certs_path).map_err(|e| StorageError::io(&certs_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(base_path, fs::Permissions::from_mode(0o700))
                .map_err(|e| StorageError::io(base_path, e))?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    /// Get the storage base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path of the account identity file
    pub fn account_path(&self) -> PathBuf {
        self.base_path.join("registration.json")
    }

    /// Path of the certificate chain for a registrable domain
    pub fn certificate_path(&self, domain: &str) -> PathBuf {
        self.base_path.join("certs").join(format!("{domain}.pem"))
    }

    /// Path of the private key for a registrable domain
    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.base_path.join("certs").join(format!("{domain}.key"))
    }

    /// Whether both halves of the pair exist on disk
    pub fn has_certificate(&self, domain: &str) -> bool {
        let present = self.certificate_path(domain).exists() && self.key_path(domain).exists();
        trace!(domain = %domain, present, "Checked for stored certificate");
        present
    }

    /// Classify the stored pair for `domain`
    ///
    /// A crash between the key and certificate writes of
    /// [`save_certificate`](Self::save_certificate) leaves a new key next to
    /// the old certificate; nginx refuses to load such a pair, so it is
    /// reported as [`StoredPair::Mismatched`].
    pub fn stored_pair(&self, domain: &str) -> Result<StoredPair, StorageError> {
        if !self.has_certificate(domain) {
            return Ok(StoredPair::Absent);
        }

        let cert_path = self.certificate_path(domain);
        let cert_data = fs::read(&cert_path).map_err(|e| StorageError::io(&cert_path, e))?;
        // An unparsable certificate is reported by the validity check
        let Ok(info) = parse_certificate(&cert_data, &cert_path) else {
            return Ok(StoredPair::Present);
        };

        let key_path = self.key_path(domain);
        let key_pem = fs::read_to_string(&key_path).map_err(|e| StorageError::io(&key_path, e))?;
        let matches = KeyPair::from_pem(&key_pem)
            .map(|key| key.subject_public_key_info() == info.public_key_der)
            .unwrap_or(false);

        Ok(if matches {
            StoredPair::Present
        } else {
            StoredPair::Mismatched
        })
    }

    /// Read the stored certificate chain
    pub fn load_certificate_pem(&self, domain: &str) -> Result<Option<String>, StorageError> {
        let path = self.certificate_path(domain);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| StorageError::io(path, e))
    }

    /// Replace the key and certificate chain for a registrable domain
    ///
    /// The key is written and synced before the chain so that a crash in
    /// between never leaves a certificate whose key does not exist.
    pub fn save_certificate(
        &self,
        domain: &str,
        key_pem: &str,
        chain_pem: &str,
    ) -> Result<(), StorageError> {
        let key_path = self.key_path(domain);
        let cert_path = self.certificate_path(domain);

        write_file_atomic(&key_path, key_pem.as_bytes(), true)?;
        debug!(path = %key_path.display(), "Wrote private key");

        write_file_atomic(&cert_path, chain_pem.as_bytes(), false)?;
        debug!(path = %cert_path.display(), "Wrote certificate chain");

        info!(domain = %domain, "Saved certificate to storage");
        Ok(())
    }

    /// Make sure nginx has something to load for `domain`
    ///
    /// Writes a self-signed pair when no usable pair exists. Returns `true`
    /// when a placeholder was written.
    pub fn ensure_placeholder(&self, domain: &str) -> Result<bool, StorageError> {
        match self.stored_pair(domain)? {
            StoredPair::Present => return Ok(false),
            StoredPair::Mismatched => {
                warn!(domain = %domain, "Stored key does not match certificate, replacing pair");
            }
            StoredPair::Absent => {}
        }

        let placeholder = selfsigned::generate_placeholder(domain)?;
        self.save_certificate(domain, &placeholder.key_pem, &placeholder.cert_pem)?;

        info!(domain = %domain, "Wrote placeholder certificate");
        Ok(true)
    }
}

/// Write a file atomically
///
/// Writes `<target>.tmp`, syncs it, sets permissions (0600 when `private`,
/// 0644 otherwise) and renames it over `target`.
pub(crate) fn write_file_atomic(
    target: &Path,
    content: &[u8],
    private: bool,
) -> Result<(), StorageError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }

    let mut temp_name = target.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut file = fs::File::create(&temp_path).map_err(|e| StorageError::io(&temp_path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if private { 0o600 } else { 0o644 };
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| StorageError::io(&temp_path, e))?;
    }
    #[cfg(not(unix))]
    let _ = private;

    file.write_all(content)
        .map_err(|e| StorageError::io(&temp_path, e))?;
    file.sync_all().map_err(|e| StorageError::io(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, target).map_err(|e| StorageError::io(target, e))?;

    Ok(())
}
