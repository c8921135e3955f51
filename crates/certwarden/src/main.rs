//! certwarden - nginx supervisor with automatic ACME certificates

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use certwarden::settings::{self, DEFAULT_LISTEN_HTTP, DEFAULT_STORAGE_DIR};
use certwarden::{app, Settings};
use certwarden_config::ConfigSet;

/// Keeps nginx running with ACME certificates for every server_name it serves
#[derive(Parser, Debug)]
#[command(name = "certwarden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Main nginx configuration file
    #[arg(long = "nginx-config", env = "NGINX_CONFIG")]
    nginx_config: PathBuf,

    /// Contact email, required for the first account registration
    #[arg(long, env = "EMAIL")]
    email: Option<String>,

    /// Directory for certificates, keys and the account
    #[arg(long = "storage-dir", env = "STORAGE_DIR", default_value = DEFAULT_STORAGE_DIR)]
    storage_dir: PathBuf,

    /// Renew certificates expiring within this many hours
    #[arg(long = "renew-before-hours", env = "BUFFER_HOURS", default_value_t = 360)]
    renew_before_hours: u32,

    /// Listen address for HTTP-01 challenges
    #[arg(long = "listen-http", env = "LISTEN_HTTP", default_value = DEFAULT_LISTEN_HTTP)]
    listen_http: SocketAddr,

    /// ACME directory URL (defaults to Let's Encrypt)
    #[arg(long = "acme-server", env = "ACME_SERVER")]
    acme_server: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[arg(long, env = "ACME_STAGING")]
    staging: bool,

    /// Seconds between reconciliation passes
    #[arg(long = "check-interval-secs", env = "CHECK_INTERVAL_SECS", default_value_t = 60)]
    check_interval_secs: u64,

    /// Milliseconds to wait before restarting nginx
    #[arg(long = "restart-backoff-ms", env = "RESTART_BACKOFF_MS", default_value_t = 500)]
    restart_backoff_ms: u64,

    /// nginx executable
    #[arg(long = "nginx-binary", env = "NGINX_BINARY", default_value = "nginx")]
    nginx_binary: PathBuf,

    /// Address nginx must accept connections on before it counts as running
    #[arg(long = "ready-probe", env = "READY_PROBE")]
    ready_probe: Option<SocketAddr>,

    /// Log level or filter directives (overridden by RUST_LOG)
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long = "log-format", env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print the discovered certificate groups and exit
    #[arg(long)]
    check: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn into_settings(self) -> Settings {
        let home = std::env::var_os("HOME").map(PathBuf::from);

        Settings {
            directory_url: settings::directory_url(self.acme_server.as_deref(), self.staging),
            storage_dir: settings::expand_home(&self.storage_dir, home.as_deref()),
            nginx_config: self.nginx_config,
            nginx_binary: self.nginx_binary,
            email: self.email,
            renew_before: chrono::Duration::hours(i64::from(self.renew_before_hours)),
            listen_http: self.listen_http,
            check_interval: Duration::from_secs(self.check_interval_secs.max(1)),
            restart_backoff: Duration::from_millis(self.restart_backoff_ms),
            ready_probe: self.ready_probe,
        }
    }
}

/// Parse `--log-level`; an invalid value is an error rather than a silent default
fn log_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).with_context(|| format!("Failed to parse log level {level:?}"))
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let configured = log_filter(level)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or(configured);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

/// Print certificate groups and exit
fn check_config(cli: &Cli) -> Result<()> {
    let config = ConfigSet::load(&cli.nginx_config).with_context(|| {
        format!(
            "Failed to load nginx configuration {}",
            cli.nginx_config.display()
        )
    })?;

    let groups = config.domain_groups();
    info!(
        files = config.sources().len(),
        groups = groups.len(),
        fingerprint = %config.fingerprint(),
        "Configuration check"
    );

    for (domain, names) in &groups {
        println!("{domain}: {}", names.join(" "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    if cli.check {
        return check_config(&cli);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    runtime.block_on(app::run(cli.into_settings()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["certwarden", "--nginx-config", "/etc/nginx/nginx.conf"])
            .unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);

        let settings = cli.into_settings();
        assert_eq!(settings.renew_before.num_hours(), 360);
        assert_eq!(settings.listen_http.port(), 5001);
        assert_eq!(settings.restart_backoff, Duration::from_millis(500));
        assert_eq!(settings.directory_url, certwarden::acme::LETS_ENCRYPT_PRODUCTION);
    }

    #[test]
    fn test_log_level_is_validated() {
        assert!(log_filter("info").is_ok());
        assert!(log_filter("certwarden=debug,warn").is_ok());
        assert!(log_filter("certwarden=loud").is_err());
    }

    #[test]
    fn test_staging_flag() {
        let cli = Cli::try_parse_from([
            "certwarden",
            "--nginx-config",
            "nginx.conf",
            "--staging",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(
            cli.into_settings().directory_url,
            certwarden::acme::LETS_ENCRYPT_STAGING
        );
    }
}
