//! Whole reconciliation passes against a fake CA and a fake nginx

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Datelike, Duration, Utc};
use rcgen::{date_time_ymd, CertificateParams, KeyPair};
use tempfile::TempDir;
use tokio::sync::Notify;

use certwarden::acme::{
    AcquisitionDriver, CertificateIssuer, CertificateStorage, IssueFailure, IssuedCertificate,
    StoredPair,
};
use certwarden::{ManagedProcess, PassOutcome, ProcessError, Reconciler};

fn self_signed(names: &[String], days_valid: i64) -> (String, String) {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(names.to_vec()).unwrap();
    let expiry = Utc::now() + Duration::days(days_valid);
    params.not_after = date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);
    let cert = params.self_signed(&key_pair).unwrap();
    (cert.pem(), key_pair.serialize_pem())
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Records every order and rejects the names listed in `rejected`
#[derive(Default)]
struct FakeIssuer {
    orders: Mutex<Vec<Vec<String>>>,
    rejected: Vec<String>,
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    async fn obtain(&self, domains: &[String]) -> Result<IssuedCertificate, IssueFailure> {
        self.orders.lock().unwrap().push(domains.to_vec());

        let mut failure = IssueFailure::default();
        for domain in domains.iter().filter(|d| self.rejected.contains(d)) {
            failure
                .failures
                .insert(domain.clone(), "urn:ietf:params:acme:error:unauthorized".to_string());
        }
        if !failure.failures.is_empty() {
            return Err(failure);
        }

        let (certificate_pem, private_key_pem) = self_signed(domains, 90);
        let (issuer_certificate_pem, _) = self_signed(&names(&["intermediate.test"]), 365);
        Ok(IssuedCertificate {
            private_key_pem,
            certificate_pem,
            issuer_certificate_pem,
        })
    }
}

/// Counts reloads; when `started` is set, stays "starting" until notified
#[derive(Default)]
struct FakeProcess {
    reloads: AtomicUsize,
    started: Option<Arc<Notify>>,
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    async fn wait_until_running(&self) -> Result<(), ProcessError> {
        if let Some(started) = &self.started {
            started.notified().await;
        }
        Ok(())
    }

    fn signal_reload(&self) -> Result<(), ProcessError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    config: PathBuf,
    storage: Arc<CertificateStorage>,
    issuer: Arc<FakeIssuer>,
    process: Arc<FakeProcess>,
    reconciler: Reconciler,
}

impl Harness {
    fn new(config_text: &str, issuer: FakeIssuer) -> Self {
        Self::with_process(config_text, issuer, FakeProcess::default())
    }

    fn with_process(config_text: &str, issuer: FakeIssuer, process: FakeProcess) -> Self {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("nginx.conf");
        fs::write(&config, config_text).unwrap();

        let storage = Arc::new(CertificateStorage::new(&dir.path().join("storage")).unwrap());
        let issuer = Arc::new(issuer);
        let process = Arc::new(process);
        let driver = AcquisitionDriver::new(issuer.clone(), storage.clone());
        let reconciler = Reconciler::new(&config, driver, process.clone());

        Self {
            _dir: dir,
            config,
            storage,
            issuer,
            process,
            reconciler,
        }
    }

    fn orders(&self) -> Vec<Vec<String>> {
        self.issuer.orders.lock().unwrap().clone()
    }

    fn reloads(&self) -> usize {
        self.process.reloads.load(Ordering::SeqCst)
    }
}

const TWO_NAMES: &str = "\
http {
    server {
        listen 443 ssl;
        server_name b.example.com a.example.com;
        ssl_certificate /var/lib/certwarden/certs/example.com.pem;
        ssl_certificate_key /var/lib/certwarden/certs/example.com.key;
    }
}
";

#[tokio::test]
async fn test_group_is_issued_in_canonical_order() {
    let mut h = Harness::new(TWO_NAMES, FakeIssuer::default());

    let outcome = h.reconciler.run_pass().await.unwrap();

    assert_eq!(outcome, PassOutcome::Reloaded { changed: 1 });
    assert_eq!(h.orders(), vec![names(&["a.example.com", "b.example.com"])]);
    assert_eq!(h.reloads(), 1);

    let chain = h.storage.load_certificate_pem("example.com").unwrap().unwrap();
    assert_eq!(chain.matches("BEGIN CERTIFICATE").count(), 2);
}

#[tokio::test]
async fn test_expiring_certificate_is_renewed() {
    let mut h = Harness::new(
        "server {\n    server_name example.com;\n}\n",
        FakeIssuer::default(),
    );
    let (cert_pem, key_pem) = self_signed(&names(&["example.com"]), 10);
    h.storage
        .save_certificate("example.com", &key_pem, &cert_pem)
        .unwrap();

    let outcome = h.reconciler.run_pass().await.unwrap();

    assert_eq!(outcome, PassOutcome::Reloaded { changed: 1 });
    assert_eq!(h.orders(), vec![names(&["example.com"])]);
    assert_ne!(
        h.storage.load_certificate_pem("example.com").unwrap().unwrap(),
        cert_pem
    );
}

#[tokio::test]
async fn test_partial_failure_keeps_files_and_skips_reload() {
    let issuer = FakeIssuer {
        rejected: names(&["b.example.com"]),
        ..FakeIssuer::default()
    };
    let mut h = Harness::new(TWO_NAMES, issuer);

    let (cert_pem, key_pem) = self_signed(&names(&["a.example.com"]), 90);
    h.storage
        .save_certificate("example.com", &key_pem, &cert_pem)
        .unwrap();

    let outcome = h.reconciler.run_pass().await.unwrap();

    assert_eq!(
        outcome,
        PassOutcome::Aborted {
            errored: names(&["example.com"])
        }
    );
    assert_eq!(h.reloads(), 0);
    assert_eq!(
        fs::read_to_string(h.storage.certificate_path("example.com")).unwrap(),
        cert_pem
    );
    assert_eq!(
        fs::read_to_string(h.storage.key_path("example.com")).unwrap(),
        key_pem
    );
}

#[tokio::test]
async fn test_config_edit_reloads_exactly_once() {
    let mut h = Harness::new(TWO_NAMES, FakeIssuer::default());

    assert_eq!(
        h.reconciler.run_pass().await.unwrap(),
        PassOutcome::Reloaded { changed: 1 }
    );
    assert_eq!(h.reconciler.run_pass().await.unwrap(), PassOutcome::Unchanged);
    assert_eq!(h.reloads(), 1);

    // Same names, different content
    fs::write(&h.config, format!("{TWO_NAMES}# tuned worker settings\n")).unwrap();

    assert_eq!(
        h.reconciler.run_pass().await.unwrap(),
        PassOutcome::Reloaded { changed: 0 }
    );
    assert_eq!(h.reconciler.run_pass().await.unwrap(), PassOutcome::Unchanged);
    assert_eq!(h.reloads(), 2);
    assert_eq!(h.orders().len(), 1);
}

#[tokio::test]
async fn test_included_files_are_tracked() {
    let mut h = Harness::new(
        "http {\n    include sites-enabled/*.conf;\n}\n",
        FakeIssuer::default(),
    );
    let sites = h.config.parent().unwrap().join("sites-enabled");
    fs::create_dir(&sites).unwrap();
    fs::write(sites.join("shop.conf"), "server {\n    server_name shop.example.org;\n}\n").unwrap();

    h.reconciler.run_pass().await.unwrap();
    assert_eq!(h.orders(), vec![names(&["shop.example.org"])]);

    fs::write(
        sites.join("blog.conf"),
        "server {\n    server_name blog.example.net;\n}\n",
    )
    .unwrap();

    assert_eq!(
        h.reconciler.run_pass().await.unwrap(),
        PassOutcome::Reloaded { changed: 1 }
    );
    assert_eq!(h.orders().last().unwrap(), &names(&["blog.example.net"]));
    assert!(h.storage.has_certificate("example.net"));
}

#[tokio::test]
async fn test_no_order_before_process_is_running() {
    let started = Arc::new(Notify::new());
    let process = FakeProcess {
        started: Some(started.clone()),
        ..FakeProcess::default()
    };
    let mut h = Harness::with_process(TWO_NAMES, FakeIssuer::default(), process);

    let pass = h.reconciler.run_pass();
    tokio::pin!(pass);

    let pending = tokio::time::timeout(StdDuration::from_millis(200), &mut pass).await;
    assert!(pending.is_err());
    assert!(h.issuer.orders.lock().unwrap().is_empty());
    // Placeholders are written before the wait so nginx can start
    assert!(h.storage.has_certificate("example.com"));

    started.notify_one();
    let outcome = pass.await.unwrap();

    assert_eq!(outcome, PassOutcome::Reloaded { changed: 1 });
    assert_eq!(
        *h.issuer.orders.lock().unwrap(),
        vec![names(&["a.example.com", "b.example.com"])]
    );
}

#[tokio::test]
async fn test_interrupted_save_is_repaired_before_start() {
    let h = Harness::new(TWO_NAMES, FakeIssuer::default());
    let group = names(&["a.example.com", "b.example.com"]);

    let (old_cert, old_key) = self_signed(&group, 90);
    h.storage
        .save_certificate("example.com", &old_key, &old_cert)
        .unwrap();

    // New key in place, certificate never written
    let (_, new_key) = self_signed(&group, 90);
    fs::write(h.storage.key_path("example.com"), &new_key).unwrap();
    assert_eq!(
        h.storage.stored_pair("example.com").unwrap(),
        StoredPair::Mismatched
    );

    h.reconciler.prepare().unwrap();

    assert_eq!(
        h.storage.stored_pair("example.com").unwrap(),
        StoredPair::Present
    );
    assert_ne!(
        h.storage.load_certificate_pem("example.com").unwrap().unwrap(),
        old_cert
    );
    assert!(h.orders().is_empty());
}
