//! SSH transport for remote commands.
//!
//! Commands run through the system `ssh` binary (or `sshpass -e ssh` for
//! password logins). Every invocation shares one OpenSSH control master, so
//! the handshake happens once per session and concurrent commands are
//! multiplexed as channels over the same connection.

use crate::config::{Credentials, SshConfig};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit status `ssh` reserves for its own failures.
const SSH_ERROR_EXIT: i32 = 255;
/// `sshpass` exit status for a rejected password.
const SSHPASS_BAD_PASSWORD_EXIT: i32 = 5;
/// How long the control master lingers after the last channel closes.
const CONTROL_PERSIST_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication rejected by {host}: {message}")]
    Auth { host: String, message: String },
    #[error("cannot reach {host}: {message}")]
    Network { host: String, message: String },
    #[error("remote command did not finish within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("ssh channel failed: {0}")]
    Channel(String),
    #[error("cannot stage identity key: {0}")]
    KeyFile(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

/// Establishes sessions to the one configured host.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>, TransportError>;
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// `user@host` the session authenticated as.
    fn identity(&self) -> String;

    fn is_alive(&self) -> bool;

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError>;

    async fn close(&self);
}

#[derive(Debug)]
struct SshInvocation {
    host: String,
    port: u16,
    username: String,
    credentials: Credentials,
    connect_timeout: Duration,
    control_path: PathBuf,
    /// Where key content from the environment is written while connected.
    key_file: PathBuf,
}

impl SshInvocation {
    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    fn command(&self) -> Command {
        let mut cmd = match &self.credentials {
            Credentials::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh");
                cmd.env("SSHPASS", password.expose_secret());
                cmd.arg("-o").arg("PubkeyAuthentication=no");
                cmd
            }
            Credentials::IdentityFile(path) => key_command(path),
            Credentials::KeyContent(_) => key_command(&self.key_file),
        };

        cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        cmd.arg("-o").arg(format!(
            "ConnectTimeout={}",
            self.connect_timeout.as_secs().max(1)
        ));
        cmd.arg("-o").arg("ControlMaster=auto");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        cmd.arg("-o")
            .arg(format!("ControlPersist={CONTROL_PERSIST_SECS}"));
        cmd.arg("-p").arg(self.port.to_string());
        cmd.arg(self.destination());

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Writes key content to `key_file` when the credentials carry one.
    async fn stage_key(&self) -> Result<(), TransportError> {
        if let Credentials::KeyContent(key) = &self.credentials {
            write_key_file(&self.key_file, key)
                .await
                .map_err(TransportError::KeyFile)?;
        }
        Ok(())
    }

    async fn unstage_key(&self) {
        if matches!(self.credentials, Credentials::KeyContent(_)) {
            remove_key_file(&self.key_file).await;
        }
    }

    fn classify_connect_failure(&self, exit_code: Option<i32>, stderr: &str) -> TransportError {
        let message = stderr.trim().to_string();
        let lower = message.to_ascii_lowercase();
        let auth = exit_code == Some(SSHPASS_BAD_PASSWORD_EXIT)
            || lower.contains("permission denied")
            || lower.contains("authentication failed")
            || lower.contains("host key verification failed")
            || lower.contains("too many authentication failures");
        if auth {
            TransportError::Auth {
                host: self.host.clone(),
                message,
            }
        } else {
            TransportError::Network {
                host: self.host.clone(),
                message: if message.is_empty() {
                    format!("ssh exited with {exit_code:?}")
                } else {
                    message
                },
            }
        }
    }
}

/// [`Transport`] backed by the OpenSSH client binaries.
pub struct OpenSshTransport {
    invocation: Arc<SshInvocation>,
}

impl OpenSshTransport {
    pub fn new(cfg: &SshConfig, credentials: Credentials) -> Self {
        let stem = format!("gpumond-{}-{}", std::process::id(), cfg.port);
        let control_path = std::env::temp_dir().join(format!("{stem}.sock"));
        let key_file = std::env::temp_dir().join(format!("{stem}.key"));
        Self {
            invocation: Arc::new(SshInvocation {
                host: cfg.host.clone(),
                port: cfg.port,
                username: cfg.username.clone(),
                credentials,
                connect_timeout: cfg.connect_timeout(),
                control_path,
                key_file,
            }),
        }
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>, TransportError> {
        let inv = &self.invocation;
        inv.stage_key().await?;
        let mut cmd = inv.command();
        cmd.arg("true");

        // The handshake itself is bounded by ConnectTimeout; this covers a
        // server that accepts the TCP connection and then stalls.
        let limit = inv.connect_timeout * 2;
        let result = match tokio::time::timeout(limit, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(inv.classify_connect_failure(output.status.code(), &stderr))
            }
            Ok(Err(err)) => Err(TransportError::Network {
                host: inv.host.clone(),
                message: format!("failed to spawn ssh: {err}"),
            }),
            Err(_elapsed) => Err(TransportError::Network {
                host: inv.host.clone(),
                message: format!("handshake did not complete within {}s", limit.as_secs()),
            }),
        };
        if let Err(err) = result {
            inv.unstage_key().await;
            return Err(err);
        }

        debug!(destination = %inv.destination(), "ssh control master is up");
        Ok(Arc::new(OpenSshSession {
            invocation: inv.clone(),
            alive: AtomicBool::new(true),
        }))
    }
}

pub struct OpenSshSession {
    invocation: Arc<SshInvocation>,
    alive: AtomicBool,
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    fn identity(&self) -> String {
        self.invocation.destination()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        let mut cmd = self.invocation.command();
        cmd.arg(command);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                self.alive.store(false, Ordering::Release);
                return Err(TransportError::Channel(format!(
                    "failed to spawn ssh: {err}"
                )));
            }
            // Dropping the future kills the child (kill_on_drop).
            Err(_elapsed) => return Err(TransportError::Timeout(timeout)),
        };

        let exit_code = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // A remote tool may exit 255 itself; only ssh's own diagnostics mean
        // the channel is gone.
        if exit_code == Some(SSH_ERROR_EXIT) && is_ssh_failure(&stderr) {
            self.alive.store(false, Ordering::Release);
            return Err(TransportError::Channel(stderr.trim().to_string()));
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code,
        })
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!(
                "ControlPath={}",
                self.invocation.control_path.display()
            ))
            .arg("-O")
            .arg("exit")
            .arg(self.invocation.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Err(err) = cmd.status().await {
            debug!(error = %err, "failed to stop ssh control master");
        }
        self.invocation.unstage_key().await;
    }
}

fn key_command(path: &Path) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-o").arg("BatchMode=yes");
    cmd.arg("-o").arg("IdentitiesOnly=yes");
    cmd.arg("-i").arg(path);
    cmd
}

/// Creates `path` readable by the owner only. ssh refuses keys with wider
/// permissions and keys without a trailing newline.
async fn write_key_file(path: &Path, key: &SecretString) -> std::io::Result<()> {
    remove_key_file(path).await;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;

    let key = key.expose_secret();
    file.write_all(key.as_bytes()).await?;
    if !key.ends_with('\n') {
        file.write_all(b"\n").await?;
    }
    file.sync_all().await
}

async fn remove_key_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(error = %err, path = %path.display(), "failed to remove staged key"),
    }
}

/// Messages ssh itself prints when the connection or multiplexer fails.
const SSH_FAILURE_MARKERS: [&str; 14] = [
    "ssh:",
    "kex_exchange_identification",
    "ssh_exchange_identification",
    "connection closed",
    "connection reset",
    "connection refused",
    "connection timed out",
    "broken pipe",
    "mux_client",
    "control socket",
    "client_loop",
    "packet_write_wait",
    "permission denied",
    "host key verification failed",
];

fn is_ssh_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    SSH_FAILURE_MARKERS.iter().any(|m| lower.contains(m))
}
