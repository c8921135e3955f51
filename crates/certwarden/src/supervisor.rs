//! nginx process supervision
//!
//! The supervisor keeps exactly one nginx child alive in the foreground
//! (`daemon off;`), restarting it after a fixed backoff whenever it exits or
//! fails to spawn. Its state is published on a `watch` channel so that the
//! reconciler can wait for the process without polling.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default pause between an exit and the next start
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// Interval between readiness probe attempts
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: u32 },
    Restarting,
}

/// Errors interacting with the supervised process
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Process is not running")]
    NotRunning,

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Process supervisor has stopped")]
    Stopped,
}

/// The operations the reconciler needs from the proxy process
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    /// Resolve once the process is running
    async fn wait_until_running(&self) -> Result<(), ProcessError>;

    /// Ask the running process to reload its configuration
    fn signal_reload(&self) -> Result<(), ProcessError>;
}

/// What to run and how to supervise it
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub restart_backoff: Duration,
    /// Address that must accept connections before the process counts as running
    pub ready_probe: Option<SocketAddr>,
}

impl SupervisorConfig {
    /// Run `binary -c <config> -g "daemon off;"`
    pub fn nginx(binary: impl Into<PathBuf>, config: &Path) -> Self {
        Self {
            program: binary.into(),
            args: vec![
                "-c".to_string(),
                config.display().to_string(),
                "-g".to_string(),
                "daemon off;".to_string(),
            ],
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            ready_probe: None,
        }
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_ready_probe(mut self, addr: Option<SocketAddr>) -> Self {
        self.ready_probe = addr;
        self
    }
}

/// Restart loop for one child process
#[derive(Debug)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    state: watch::Sender<ProcessState>,
}

/// Observer side of a [`ProcessSupervisor`]
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    state: watch::Receiver<ProcessState>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> (Self, ProcessHandle) {
        let (state, receiver) = watch::channel(ProcessState::NotStarted);
        (Self { config, state }, ProcessHandle { state: receiver })
    }

    /// Run the restart loop in a background task
    ///
    /// Aborting the task kills the child.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        loop {
            self.run_once().await;
            self.state.send_replace(ProcessState::Restarting);
            debug!(
                backoff_ms = self.config.restart_backoff.as_millis() as u64,
                "Restarting process after backoff"
            );
            tokio::time::sleep(self.config.restart_backoff).await;
        }
    }

    /// Start the process and wait for it to exit
    async fn run_once(&self) {
        let program = self.config.program.display();
        let mut child = match Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(program = %program, error = %e, "Failed to start process");
                return;
            }
        };

        let Some(pid) = child.id() else {
            warn!(program = %program, "Process exited immediately");
            return;
        };
        info!(program = %program, pid = pid, "Process started");

        let early_exit = match self.config.ready_probe {
            Some(addr) => tokio::select! {
                status = child.wait() => Some(status),
                () = wait_for_listener(addr) => None,
            },
            None => None,
        };

        let status = match early_exit {
            Some(status) => status,
            None => {
                self.state.send_replace(ProcessState::Running { pid });
                info!(pid = pid, "Process is running");
                child.wait().await
            }
        };

        match status {
            Ok(status) => warn!(pid = pid, status = %status, "Process exited"),
            Err(e) => error!(pid = pid, error = %e, "Failed to wait for process"),
        }
    }
}

/// Resolve once `addr` accepts a TCP connection
async fn wait_for_listener(addr: SocketAddr) {
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            debug!(addr = %addr, "Readiness probe succeeded");
            return;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

impl ProcessHandle {
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }
}

#[async_trait]
impl ManagedProcess for ProcessHandle {
    async fn wait_until_running(&self) -> Result<(), ProcessError> {
        let mut state = self.state.clone();
        if !matches!(*state.borrow(), ProcessState::Running { .. }) {
            info!("Waiting for process to start");
        }

        let running = state
            .wait_for(|s| matches!(s, ProcessState::Running { .. }))
            .await
            .is_ok();

        if running {
            Ok(())
        } else {
            Err(ProcessError::Stopped)
        }
    }

    fn signal_reload(&self) -> Result<(), ProcessError> {
        let ProcessState::Running { pid } = self.state() else {
            return Err(ProcessError::NotRunning);
        };

        kill(Pid::from_raw(pid as i32), Signal::SIGHUP)
            .map_err(|source| ProcessError::Signal { pid, source })?;

        info!(pid = pid, "Sent SIGHUP to reload configuration");
        Ok(())
    }
}
