//! Tracked configuration file set
//!
//! The main configuration file is the one handed to nginx with `-c`. Any
//! `include` directive it (transitively) contains is followed, so that
//! `server_name` directives kept in `sites-enabled/*` style files are seen
//! and edits to them change the fingerprint.
//!
//! Relative include paths are resolved against the directory of the main
//! file, which is how nginx resolves them when started with `-c`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use crate::domains::{group_server_names, DomainGroups};
use crate::error::ConfigError;
use crate::fingerprint::Fingerprint;
use crate::server_names::collect_server_names;

static INCLUDE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*include\s+([^;]+);").expect("include pattern is valid"));

/// One configuration file and the content it had when loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSource {
    pub path: PathBuf,
    pub contents: String,
}

/// Snapshot of every configuration file that contributes to the proxy setup
#[derive(Debug, Clone)]
pub struct ConfigSet {
    sources: Vec<ConfigSource>,
}

impl ConfigSet {
    /// Read the main configuration file and everything it includes
    ///
    /// # Errors
    ///
    /// Any file that cannot be read is an error: acting on a partial view of
    /// the configured domains could drop coverage for the unread part.
    pub fn load(main: &Path) -> Result<Self, ConfigError> {
        let base = main
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut set = Self {
            sources: Vec::new(),
        };
        let mut seen = HashSet::new();
        set.load_file(main, &base, &mut seen)?;

        debug!(
            main = %main.display(),
            files = set.sources.len(),
            "Loaded configuration file set"
        );

        Ok(set)
    }

    /// Build a set from already-read sources
    pub fn from_sources(sources: Vec<ConfigSource>) -> Self {
        Self { sources }
    }

    fn load_file(
        &mut self,
        path: &Path,
        base: &Path,
        seen: &mut HashSet<PathBuf>,
    ) -> Result<(), ConfigError> {
        if !seen.insert(path.to_path_buf()) {
            trace!(path = %path.display(), "Configuration file already loaded");
            return Ok(());
        }

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let includes: Vec<String> = contents
            .lines()
            .filter_map(|line| INCLUDE_LINE.captures(line))
            .filter_map(|captures| captures.get(1))
            .map(|m| m.as_str().trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .collect();

        self.sources.push(ConfigSource {
            path: path.to_path_buf(),
            contents,
        });

        for pattern in includes {
            for included in resolve_include(&pattern, base)? {
                self.load_file(&included, base, seen)?;
            }
        }

        Ok(())
    }

    /// Loaded files, main file first
    pub fn sources(&self) -> &[ConfigSource] {
        &self.sources
    }

    /// Paths of the loaded files
    pub fn paths(&self) -> Vec<&Path> {
        self.sources.iter().map(|s| s.path.as_path()).collect()
    }

    /// Every certificate-eligible server name across all files
    pub fn server_names(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(|source| collect_server_names(&source.contents))
            .collect()
    }

    /// Server names grouped by registrable domain
    pub fn domain_groups(&self) -> DomainGroups {
        group_server_names(self.server_names())
    }

    /// Content fingerprint of the whole set
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_sources(&self.sources)
    }
}

/// Expand an `include` argument into concrete paths
fn resolve_include(pattern: &str, base: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let full = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        base.join(pattern)
    };

    if !pattern.contains(['*', '?', '[']) {
        return Ok(vec![full]);
    }

    let full_pattern = full.to_string_lossy().into_owned();
    let entries = glob::glob(&full_pattern).map_err(|e| ConfigError::IncludePattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| ConfigError::Read {
            path: e.path().to_path_buf(),
            source: std::io::Error::new(e.error().kind(), e.error().to_string()),
        })?;
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    trace!(pattern = %pattern, matches = paths.len(), "Expanded include pattern");
    Ok(paths)
}
