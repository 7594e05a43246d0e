use crate::state::{FailureKind, Metric};
use crate::transport::{RemoteSession, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The fixed set of introspection commands. Nothing user-supplied is ever
/// interpolated into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCommand {
    GpuQuery,
    GpuProcesses,
    Memory,
    RootDisk,
    Partitions,
    CpuUsage,
    CpuCores,
    Sessions,
    Processes,
    HomeUsage,
}

impl RemoteCommand {
    #[cfg(test)]
    pub const ALL: [RemoteCommand; 10] = [
        RemoteCommand::GpuQuery,
        RemoteCommand::GpuProcesses,
        RemoteCommand::Memory,
        RemoteCommand::RootDisk,
        RemoteCommand::Partitions,
        RemoteCommand::CpuUsage,
        RemoteCommand::CpuCores,
        RemoteCommand::Sessions,
        RemoteCommand::Processes,
        RemoteCommand::HomeUsage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RemoteCommand::GpuQuery => "gpu_query",
            RemoteCommand::GpuProcesses => "gpu_processes",
            RemoteCommand::Memory => "memory",
            RemoteCommand::RootDisk => "root_disk",
            RemoteCommand::Partitions => "partitions",
            RemoteCommand::CpuUsage => "cpu_usage",
            RemoteCommand::CpuCores => "cpu_cores",
            RemoteCommand::Sessions => "sessions",
            RemoteCommand::Processes => "processes",
            RemoteCommand::HomeUsage => "home_usage",
        }
    }

    /// Shell text sent to the remote host. The C locale keeps decimal points
    /// and column headers stable across hosts.
    pub fn shell(self) -> &'static str {
        match self {
            RemoteCommand::GpuQuery => concat!(
                "LC_ALL=C nvidia-smi ",
                "--query-gpu=index,name,memory.used,memory.total,temperature.gpu,power.draw,pci.bus_id ",
                "--format=csv,noheader,nounits"
            ),
            RemoteCommand::GpuProcesses => concat!(
                "LC_ALL=C nvidia-smi ",
                "--query-compute-apps=pid,used_memory,gpu_bus_id ",
                "--format=csv,noheader,nounits"
            ),
            RemoteCommand::Memory => "LC_ALL=C free -b",
            RemoteCommand::RootDisk => "LC_ALL=C df -P -B1 /",
            RemoteCommand::Partitions => {
                "LC_ALL=C df -P -B1 -x tmpfs -x devtmpfs -x squashfs -x overlay"
            }
            RemoteCommand::CpuUsage => "LC_ALL=C top -bn1 | head -5",
            RemoteCommand::CpuCores => "LC_ALL=C lscpu",
            RemoteCommand::Sessions => "LC_ALL=C who",
            RemoteCommand::Processes => "LC_ALL=C ps -eo pid=,user:64=,pcpu=,pmem=",
            // du exits non-zero on any unreadable entry; partial totals are still useful.
            RemoteCommand::HomeUsage => "LC_ALL=C du -sk /home/* 2>/dev/null; true",
        }
    }

    pub fn metric(self) -> Metric {
        match self {
            RemoteCommand::GpuQuery | RemoteCommand::GpuProcesses => Metric::Gpu,
            RemoteCommand::Memory => Metric::Memory,
            RemoteCommand::RootDisk => Metric::Disk,
            RemoteCommand::Partitions => Metric::Storage,
            RemoteCommand::CpuUsage | RemoteCommand::CpuCores => Metric::Cpu,
            RemoteCommand::Sessions | RemoteCommand::Processes | RemoteCommand::HomeUsage => {
                Metric::Users
            }
        }
    }

    fn is_slow(self) -> bool {
        matches!(self, RemoteCommand::HomeUsage)
    }
}

impl std::fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw output of one successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub command: RemoteCommand,
    pub stdout: String,
    pub exit_code: i32,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("connection failed: {0}")]
    Connection(#[source] TransportError),
    /// The session was lost and replacing it already failed this cycle.
    #[error("ssh session unavailable: {0}")]
    SessionDown(String),
    #[error("{command} timed out after {}s", .after.as_secs())]
    Timeout {
        command: RemoteCommand,
        after: Duration,
    },
    #[error("{command} exited with status {code:?}: {stderr}")]
    NonZeroExit {
        command: RemoteCommand,
        code: Option<i32>,
        stderr: String,
    },
}

impl RunError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RunError::Connection(_) | RunError::SessionDown(_) => FailureKind::Connection,
            RunError::Timeout { .. } => FailureKind::Timeout,
            RunError::NonZeroExit { .. } => FailureKind::NonZeroExit,
        }
    }
}

struct SessionSlot {
    current: Option<Arc<dyn RemoteSession>>,
    /// Bumped on every connect attempt.
    generation: u64,
    /// Why the latest attempt, or the retry on its session, failed.
    failure: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Acquire {
    /// Connect unless a live session exists.
    Connect,
    /// Use the live session. Connects only if no attempt has failed since.
    Reuse,
    /// The session of this generation died: replace it, once.
    Replace(u64),
}

/// Runs [`RemoteCommand`]s over one lazily established, reusable session.
///
/// Commands that lose the same session share one replacement attempt. When
/// it fails, every pending command fails with it and the next
/// [`CommandRunner::ensure_connected`] tries again.
pub struct CommandRunner {
    transport: Arc<dyn Transport>,
    slot: Mutex<SessionSlot>,
    command_timeout: Duration,
    slow_command_timeout: Duration,
}

impl CommandRunner {
    pub fn new(
        transport: Arc<dyn Transport>,
        command_timeout: Duration,
        slow_command_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            slot: Mutex::new(SessionSlot {
                current: None,
                generation: 0,
                failure: None,
            }),
            command_timeout,
            slow_command_timeout,
        }
    }

    pub fn timeout_for(&self, command: RemoteCommand) -> Duration {
        if command.is_slow() {
            self.slow_command_timeout
        } else {
            self.command_timeout
        }
    }

    /// Makes sure a live session exists, connecting if needed.
    pub async fn ensure_connected(&self) -> Result<(), RunError> {
        self.acquire(Acquire::Connect).await.map(|_| ())
    }

    pub async fn run(&self, command: RemoteCommand) -> Result<CommandResult, RunError> {
        let timeout = self.timeout_for(command);
        let (session, generation) = self.acquire(Acquire::Reuse).await?;

        let output = match session.exec(command.shell(), timeout).await {
            Ok(output) => output,
            Err(TransportError::Timeout(after)) => {
                warn!(command = %command, timeout_secs = after.as_secs(), "remote command timed out");
                return Err(RunError::Timeout { command, after });
            }
            Err(err) => {
                debug!(command = %command, error = %err, "session failed, reconnecting once");
                let (session, generation) = self.acquire(Acquire::Replace(generation)).await?;
                match session.exec(command.shell(), timeout).await {
                    Ok(output) => output,
                    Err(TransportError::Timeout(after)) => {
                        return Err(RunError::Timeout { command, after });
                    }
                    Err(err) => {
                        self.mark_down(generation, &err).await;
                        return Err(RunError::Connection(err));
                    }
                }
            }
        };

        match output.exit_code {
            Some(0) => Ok(CommandResult {
                command,
                stdout: output.stdout,
                exit_code: 0,
            }),
            code => Err(RunError::NonZeroExit {
                command,
                code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Closes the current session, if any.
    pub async fn shutdown(&self) {
        let session = self.slot.lock().await.current.take();
        if let Some(session) = session {
            session.close().await;
            info!(identity = %session.identity(), "ssh session closed");
        }
    }

    async fn acquire(&self, how: Acquire) -> Result<(Arc<dyn RemoteSession>, u64), RunError> {
        let mut slot = self.slot.lock().await;

        let must_connect = match how {
            Acquire::Connect => true,
            Acquire::Replace(dead) if dead == slot.generation => {
                slot.current = None;
                true
            }
            Acquire::Replace(_) | Acquire::Reuse => false,
        };
        if let Some(session) = slot.current.as_ref().filter(|s| s.is_alive()) {
            return Ok((session.clone(), slot.generation));
        }
        if !must_connect {
            if let Some(reason) = &slot.failure {
                return Err(RunError::SessionDown(reason.clone()));
            }
        }

        slot.current = None;
        slot.generation += 1;
        match self.transport.connect().await {
            Ok(session) => {
                info!(identity = %session.identity(), generation = slot.generation, "ssh session established");
                slot.current = Some(session.clone());
                slot.failure = None;
                Ok((session, slot.generation))
            }
            Err(err) => {
                warn!(error = %err, "ssh connect failed");
                slot.failure = Some(err.to_string());
                Err(RunError::Connection(err))
            }
        }
    }

    async fn mark_down(&self, generation: u64, err: &TransportError) {
        let mut slot = self.slot.lock().await;
        if slot.generation == generation {
            slot.current = None;
            slot.failure = Some(err.to_string());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn runs_command_and_reuses_session() {
        let transport = ScriptedTransport::with_outputs(&[
            (RemoteCommand::Memory, "Mem: 1 2 3"),
            (RemoteCommand::Sessions, "alice pts/0"),
        ]);
        let runner = runner(&transport);

        let result = runner.run(RemoteCommand::Memory).await.expect("memory");
        assert_eq!(result.stdout, "Mem: 1 2 3");
        assert_eq!(result.exit_code, 0);
        runner.run(RemoteCommand::Sessions).await.expect("sessions");

        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(transport.execs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reconnects_at_most_once_per_call() {
        let transport = ScriptedTransport::with_outputs(&[]);
        transport.script(
            RemoteCommand::Memory,
            vec![Reply::ChannelDown, Reply::Output("Mem: ok")],
        );
        let runner = runner(&transport);

        let result = runner.run(RemoteCommand::Memory).await.expect("retry succeeds");
        assert_eq!(result.stdout, "Mem: ok");
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);

        transport.script(RemoteCommand::Memory, vec![Reply::ChannelDown]);
        let err = runner.run(RemoteCommand::Memory).await.unwrap_err();
        assert!(matches!(err, RunError::Connection(_)));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_and_non_zero_exit_are_not_retried() {
        let transport = ScriptedTransport::with_outputs(&[]);
        transport.script(RemoteCommand::HomeUsage, vec![Reply::Timeout]);
        transport.script(RemoteCommand::GpuQuery, vec![Reply::Exit(9, "NVIDIA-SMI has failed")]);
        let runner = runner(&transport);

        match runner.run(RemoteCommand::HomeUsage).await {
            Err(RunError::Timeout { command, after }) => {
                assert_eq!(command, RemoteCommand::HomeUsage);
                assert_eq!(after, Duration::from_secs(30));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        match runner.run(RemoteCommand::GpuQuery).await {
            Err(RunError::NonZeroExit { code, stderr, .. }) => {
                assert_eq!(code, Some(9));
                assert_eq!(stderr, "NVIDIA-SMI has failed");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(transport.execs.load(Ordering::SeqCst), 2);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_failure_surfaces_as_connection_error() {
        let transport = ScriptedTransport::with_outputs(&[]);
        transport.refuse_auth.store(true, Ordering::SeqCst);
        let runner = runner(&transport);

        let err = runner.ensure_connected().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Connection);
        assert_eq!(transport.execs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn commands_losing_one_session_share_a_single_reconnect() {
        let transport = ScriptedTransport::with_outputs(&[]);
        for command in RemoteCommand::ALL {
            transport.script(command, vec![Reply::ChannelDown]);
        }
        let runner = Arc::new(runner(&transport));
        runner.ensure_connected().await.expect("first connect");
        transport.refuse_auth.store(true, Ordering::SeqCst);

        let mut set = JoinSet::new();
        for command in RemoteCommand::ALL {
            let runner = runner.clone();
            set.spawn(async move { runner.run(command).await });
        }
        while let Some(result) = set.join_next().await {
            let err = result.expect("command task").unwrap_err();
            assert_eq!(err.kind(), FailureKind::Connection);
        }
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);

        // A later cycle tries again.
        transport.refuse_auth.store(false, Ordering::SeqCst);
        runner.ensure_connected().await.expect("next cycle connects");
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn every_command_forces_c_locale_and_has_a_metric() {
        for command in RemoteCommand::ALL {
            assert!(command.shell().starts_with("LC_ALL=C "), "{command}");
        }
        assert_eq!(RemoteCommand::GpuProcesses.metric(), Metric::Gpu);
        assert_eq!(RemoteCommand::CpuCores.metric(), Metric::Cpu);
        assert_eq!(RemoteCommand::HomeUsage.metric(), Metric::Users);
    }
}
