//! Runtime settings shared by the coordinator

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acme::{DEFAULT_RENEW_BEFORE_HOURS, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
use crate::reconcile::DEFAULT_CHECK_INTERVAL;
use crate::supervisor::DEFAULT_RESTART_BACKOFF;

/// Default storage directory
pub const DEFAULT_STORAGE_DIR: &str = "/var/lib/certwarden";

/// Default HTTP-01 challenge listener
pub const DEFAULT_LISTEN_HTTP: &str = "0.0.0.0:5001";

/// Everything the daemon needs to run
#[derive(Debug, Clone)]
pub struct Settings {
    /// Main nginx configuration file
    pub nginx_config: PathBuf,
    /// nginx executable
    pub nginx_binary: PathBuf,
    /// Contact email for account registration
    pub email: Option<String>,
    pub storage_dir: PathBuf,
    pub renew_before: chrono::Duration,
    pub listen_http: SocketAddr,
    pub directory_url: String,
    pub check_interval: Duration,
    pub restart_backoff: Duration,
    pub ready_probe: Option<SocketAddr>,
}

impl Settings {
    /// Settings with defaults for everything but the configuration file
    pub fn new(nginx_config: impl Into<PathBuf>) -> Self {
        Self {
            nginx_config: nginx_config.into(),
            nginx_binary: PathBuf::from("nginx"),
            email: None,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            renew_before: chrono::Duration::hours(DEFAULT_RENEW_BEFORE_HOURS as i64),
            listen_http: SocketAddr::from(([0, 0, 0, 0], 5001)),
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            ready_probe: None,
        }
    }
}

/// Pick the ACME directory, letting `staging` override a default server
pub fn directory_url(acme_server: Option<&str>, staging: bool) -> String {
    match (acme_server, staging) {
        (Some(server), _) => server.to_string(),
        (None, true) => LETS_ENCRYPT_STAGING.to_string(),
        (None, false) => LETS_ENCRYPT_PRODUCTION.to_string(),
    }
}

/// Expand a leading `~/` against `home`
pub fn expand_home(path: &Path, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_selection() {
        assert_eq!(directory_url(None, false), LETS_ENCRYPT_PRODUCTION);
        assert_eq!(directory_url(None, true), LETS_ENCRYPT_STAGING);
        assert_eq!(
            directory_url(Some("https://acme.test/dir"), true),
            "https://acme.test/dir"
        );
    }

    #[test]
    fn test_expand_home() {
        let home = Path::new("/home/ops");
        assert_eq!(
            expand_home(Path::new("~/.config/certwarden"), Some(home)),
            PathBuf::from("/home/ops/.config/certwarden")
        );
        assert_eq!(
            expand_home(Path::new("/var/lib/certwarden"), Some(home)),
            PathBuf::from("/var/lib/certwarden")
        );
        assert_eq!(
            expand_home(Path::new("~/x"), None),
            PathBuf::from("~/x")
        );
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::new("/etc/nginx/nginx.conf");
        assert_eq!(settings.renew_before.num_hours(), 360);
        assert_eq!(settings.listen_http.to_string(), DEFAULT_LISTEN_HTTP);
        assert_eq!(settings.check_interval, Duration::from_secs(60));
    }
}
