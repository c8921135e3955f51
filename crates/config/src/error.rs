//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading the proxy configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid include pattern {pattern:?}: {message}")]
    IncludePattern { pattern: String, message: String },
}
