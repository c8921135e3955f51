//! Periodic reconciliation of configuration, certificates and the proxy
//!
//! Every pass re-reads the configuration, makes sure each registrable domain
//! has a certificate nginx can load, brings certificates up to date once
//! nginx is running, and sends a single reload when anything nginx reads
//! has changed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use certwarden_config::{ConfigError, ConfigSet, Fingerprint};
use thiserror::Error;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::acme::{AcquireError, AcquisitionDriver, StorageError, ValidityError};
use crate::supervisor::{ManagedProcess, ProcessError};

/// Default interval between passes
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Errors that end the reconciler
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Certificate for {domain} is corrupt: {source}")]
    Corrupt {
        domain: String,
        #[source]
        source: ValidityError,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// nginx was told to reload
    Reloaded { changed: usize },
    /// Nothing nginx reads has changed
    Unchanged,
    /// At least one group failed to get a certificate; no reload was sent
    Aborted { errored: Vec<String> },
    /// A reload was due but the signal could not be delivered
    ReloadFailed,
}

/// Drives reconciliation passes
pub struct Reconciler {
    config_path: PathBuf,
    driver: AcquisitionDriver,
    process: Arc<dyn ManagedProcess>,
    check_interval: Duration,
    /// Fingerprint of the configuration nginx last reloaded with
    last_fingerprint: Option<Fingerprint>,
    /// Certificates written since the last successful reload
    reload_pending: bool,
}

impl Reconciler {
    pub fn new(
        config_path: impl Into<PathBuf>,
        driver: AcquisitionDriver,
        process: Arc<dyn ManagedProcess>,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            driver,
            process,
            check_interval: DEFAULT_CHECK_INTERVAL,
            last_fingerprint: None,
            reload_pending: false,
        }
    }

    /// Set the interval between passes
    pub fn with_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn last_fingerprint(&self) -> Option<&Fingerprint> {
        self.last_fingerprint.as_ref()
    }

    /// Run a pass at startup and then on every interval tick
    ///
    /// Passes never overlap; a pass that outlasts the interval delays the
    /// next tick. Returns only on a fatal error.
    pub async fn run(mut self) -> Result<(), ReconcileError> {
        info!(
            config = %self.config_path.display(),
            check_interval_secs = self.check_interval.as_secs(),
            "Starting reconciler"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            debug!("Running reconciliation pass");

            if let Err(e) = self.run_pass().await {
                error!(error = %e, "Reconciliation failed");
                return Err(e);
            }
        }
    }

    /// Write placeholder certificates so nginx can start before the first pass
    ///
    /// Returns the number of registrable domains found.
    pub fn prepare(&self) -> Result<usize, ReconcileError> {
        let groups = ConfigSet::load(&self.config_path)?.domain_groups();
        self.ensure_placeholders(groups.keys())?;
        Ok(groups.len())
    }

    // nginx refuses to start without a certificate file for every server
    fn ensure_placeholders<'a>(
        &self,
        domains: impl Iterator<Item = &'a String>,
    ) -> Result<(), StorageError> {
        for domain in domains {
            if self.driver.storage().ensure_placeholder(domain)? {
                info!(domain = %domain, "Wrote placeholder certificate");
            }
        }
        Ok(())
    }

    /// Run one reconciliation pass
    pub async fn run_pass(&mut self) -> Result<PassOutcome, ReconcileError> {
        let start = Instant::now();

        let config = ConfigSet::load(&self.config_path)?;
        let fingerprint = config.fingerprint();
        let config_changed = self.last_fingerprint.as_ref() != Some(&fingerprint);
        if config_changed {
            info!(fingerprint = %fingerprint, files = config.sources().len(), "Configuration changed");
        }

        let groups = config.domain_groups();
        self.ensure_placeholders(groups.keys())?;

        self.process.wait_until_running().await?;

        let mut changed = 0;
        let mut errored = Vec::new();
        for (domain, names) in &groups {
            match self.driver.ensure_certificate(domain, names).await {
                Ok(true) => changed += 1,
                Ok(false) => debug!(domain = %domain, "Certificate is still valid"),
                Err(AcquireError::Issuance(_)) => errored.push(domain.clone()),
                Err(AcquireError::Corrupt(source)) => {
                    return Err(ReconcileError::Corrupt {
                        domain: domain.clone(),
                        source,
                    })
                }
                Err(AcquireError::Storage(e)) => return Err(e.into()),
            }
        }

        if changed > 0 {
            self.reload_pending = true;
        }

        if !errored.is_empty() {
            warn!(
                errored = ?errored,
                changed = changed,
                "Certificate acquisition failed, skipping reload until the next pass"
            );
            return Ok(PassOutcome::Aborted { errored });
        }

        if !config_changed && !self.reload_pending {
            debug!(
                groups = groups.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Nothing to reload"
            );
            return Ok(PassOutcome::Unchanged);
        }

        if let Err(e) = self.process.signal_reload() {
            warn!(error = %e, "Failed to reload nginx, retrying next pass");
            return Ok(PassOutcome::ReloadFailed);
        }

        self.last_fingerprint = Some(fingerprint);
        self.reload_pending = false;

        info!(
            groups = groups.len(),
            changed = changed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Reloaded nginx"
        );
        Ok(PassOutcome::Reloaded { changed })
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config_path", &self.config_path)
            .field("driver", &self.driver)
            .field("check_interval", &self.check_interval)
            .field("last_fingerprint", &self.last_fingerprint)
            .field("reload_pending", &self.reload_pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{CertificateIssuer, CertificateStorage, IssueFailure, IssuedCertificate};
    use async_trait::async_trait;
    use rcgen::{CertificateParams, KeyPair};
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn pem_pair(names: &[String]) -> (String, String) {
        let key_pair = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(names.to_vec())
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    /// Issues certificates unless a domain is listed in `failing`
    #[derive(Default)]
    struct Issuer {
        failing: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CertificateIssuer for Issuer {
        async fn obtain(&self, domains: &[String]) -> Result<IssuedCertificate, IssueFailure> {
            let failing = self.failing.lock().unwrap();
            if let Some(domain) = domains.iter().find(|d| failing.contains(d)) {
                return Err(IssueFailure::for_all(&[domain.clone()], "rejected"));
            }

            let (certificate_pem, private_key_pem) = pem_pair(domains);
            let (issuer_certificate_pem, _) = pem_pair(&["issuer.test".to_string()]);
            Ok(IssuedCertificate {
                private_key_pem,
                certificate_pem,
                issuer_certificate_pem,
            })
        }
    }

    #[derive(Default)]
    struct Process {
        reloads: AtomicUsize,
        gone: AtomicBool,
    }

    #[async_trait]
    impl ManagedProcess for Process {
        async fn wait_until_running(&self) -> Result<(), ProcessError> {
            Ok(())
        }

        fn signal_reload(&self) -> Result<(), ProcessError> {
            if self.gone.load(Ordering::SeqCst) {
                return Err(ProcessError::NotRunning);
            }
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: PathBuf,
        issuer: Arc<Issuer>,
        process: Arc<Process>,
        reconciler: Reconciler,
    }

    fn fixture(server_names: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("nginx.conf");
        fs::write(&config, format!("server {{\n  server_name {server_names};\n}}\n")).unwrap();

        let storage = Arc::new(CertificateStorage::new(&dir.path().join("storage")).unwrap());
        let issuer = Arc::new(Issuer::default());
        let process = Arc::new(Process::default());
        let driver = AcquisitionDriver::new(issuer.clone(), storage);
        let reconciler = Reconciler::new(&config, driver, process.clone());

        Fixture {
            _dir: dir,
            config,
            issuer,
            process,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_failed_signal_is_retried() {
        let mut f = fixture("example.com");
        f.process.gone.store(true, Ordering::SeqCst);

        assert_eq!(f.reconciler.run_pass().await.unwrap(), PassOutcome::ReloadFailed);
        assert!(f.reconciler.last_fingerprint().is_none());

        f.process.gone.store(false, Ordering::SeqCst);
        assert_eq!(
            f.reconciler.run_pass().await.unwrap(),
            PassOutcome::Reloaded { changed: 0 }
        );
        assert_eq!(f.process.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_certificates_from_aborted_pass_are_reloaded_later() {
        let mut f = fixture("example.com");
        assert!(matches!(
            f.reconciler.run_pass().await.unwrap(),
            PassOutcome::Reloaded { changed: 1 }
        ));

        // One group succeeds while another fails
        fs::write(
            &f.config,
            "server {\n  server_name example.com www.example.com;\n}\nserver {\n  server_name other.org;\n}\n",
        )
        .unwrap();
        f.issuer
            .failing
            .lock()
            .unwrap()
            .push("other.org".to_string());

        assert_eq!(
            f.reconciler.run_pass().await.unwrap(),
            PassOutcome::Aborted {
                errored: vec!["other.org".to_string()]
            }
        );
        assert_eq!(f.process.reloads.load(Ordering::SeqCst), 1);

        f.issuer.failing.lock().unwrap().clear();
        assert_eq!(
            f.reconciler.run_pass().await.unwrap(),
            PassOutcome::Reloaded { changed: 1 }
        );
        assert_eq!(f.process.reloads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_prepare_writes_placeholders() {
        let f = fixture("a.example.com b.example.com other.org");

        assert_eq!(f.reconciler.prepare().unwrap(), 2);
        let storage = f.reconciler.driver.storage();
        assert!(storage.has_certificate("example.com"));
        assert!(storage.has_certificate("other.org"));
        assert_eq!(f.process.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreadable_config_is_fatal() {
        let mut f = fixture("example.com");
        fs::remove_file(&f.config).unwrap();

        assert!(matches!(
            f.reconciler.run_pass().await,
            Err(ReconcileError::Config(_))
        ));
    }
}
