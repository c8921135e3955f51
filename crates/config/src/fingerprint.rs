//! Content fingerprint of the tracked configuration.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::sources::ConfigSource;

/// SHA-256 over every tracked file's path and content, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a set of sources in the order given
    pub fn of_sources(sources: &[ConfigSource]) -> Self {
        let mut hasher = Sha256::new();
        for source in sources {
            hasher.update(source.path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(source.contents.as_bytes());
            hasher.update([0u8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell versions apart in logs
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}
