//! certwarden
//!
//! Keeps an nginx instance running and makes sure every name it serves is
//! covered by a current ACME certificate.
//!
//! - **Discovery**: `server_name` directives are read from the nginx
//!   configuration (see [`certwarden_config`]) and grouped by registrable
//!   domain, one certificate per group
//! - **Acquisition**: missing, expiring or mismatched certificates are
//!   replaced through the [`acme`] module
//! - **Supervision**: nginx runs in the foreground under a restart loop
//! - **Reconciliation**: a periodic pass reloads nginx once whenever the
//!   configuration or a certificate changed
//!
//! # Example
//!
//! ```ignore
//! use certwarden::{app, Settings};
//!
//! let mut settings = Settings::new("/etc/nginx/nginx.conf");
//! settings.email = Some("admin@example.com".to_string());
//! app::run(settings).await?;
//! ```

pub mod acme;
pub mod app;
pub mod reconcile;
pub mod settings;
pub mod supervisor;

pub use reconcile::{PassOutcome, ReconcileError, Reconciler};
pub use settings::Settings;
pub use supervisor::{ManagedProcess, ProcessError, ProcessHandle, ProcessState, ProcessSupervisor};
