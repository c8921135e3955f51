//! Daemon coordinator
//!
//! Wires storage, the ACME account, the challenge listener, the nginx
//! supervisor and the reconciler together and runs them until a fatal error
//! or a shutdown signal.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::acme::{
    AccountError, AccountStore, AcmeClient, AcquisitionDriver, CertificateStorage,
    ChallengeManager, ChallengeServer,
};
use crate::reconcile::Reconciler;
use crate::settings::Settings;
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};

/// Run the daemon
pub async fn run(settings: Settings) -> Result<()> {
    info!(
        config = %settings.nginx_config.display(),
        storage = %settings.storage_dir.display(),
        directory = %settings.directory_url,
        "Starting certwarden"
    );

    let storage = Arc::new(
        CertificateStorage::new(&settings.storage_dir).context("Failed to open storage directory")?,
    );

    let accounts = AccountStore::new(storage.account_path());
    let mut identity = accounts
        .load_or_create(settings.email.as_deref())
        .context("Failed to load ACME account")?;
    if !identity.is_registered_with(&settings.directory_url) && identity.email.is_none() {
        return Err(AccountError::MissingEmail.into());
    }

    let challenges = ChallengeManager::new();
    let challenge_server = ChallengeServer::bind(settings.listen_http, challenges.clone())
        .await
        .with_context(|| format!("Failed to bind challenge listener on {}", settings.listen_http))?;
    let challenge_task = challenge_server.spawn();

    let (client, registered) =
        AcmeClient::connect(&settings.directory_url, &mut identity, challenges)
            .await
            .context("Failed to set up ACME account")?;
    if registered {
        accounts
            .save(&identity)
            .context("Failed to save ACME account")?;
    }

    let driver = AcquisitionDriver::new(Arc::new(client), storage)
        .with_renew_before(settings.renew_before);

    let (supervisor, process) = ProcessSupervisor::new(
        SupervisorConfig::nginx(&settings.nginx_binary, &settings.nginx_config)
            .with_restart_backoff(settings.restart_backoff)
            .with_ready_probe(settings.ready_probe),
    );

    let reconciler = Reconciler::new(&settings.nginx_config, driver, Arc::new(process))
        .with_interval(settings.check_interval);

    let domains = reconciler
        .prepare()
        .context("Failed to prepare certificates")?;
    info!(domains = domains, "Configuration loaded");

    let supervisor_task = supervisor.spawn();

    let result = tokio::select! {
        result = reconciler.run() => result.context("Reconciliation stopped"),
        () = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    // Dropping the supervisor task kills nginx
    supervisor_task.abort();
    let _ = supervisor_task.await;
    challenge_task.abort();

    info!("certwarden stopped");
    result
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
