//! Runs every [`RemoteCommand`] for one cycle and assembles a [`Snapshot`].

use super::runner::{CommandRunner, RemoteCommand};
use super::system::{
    parse_core_count, parse_cpu_usage, parse_gpus, parse_memory, parse_partitions,
    parse_root_disk, summarize_storage, ParseError,
};
use super::users::{
    assign_gpu_users, merge_users, parse_gpu_processes, parse_home_usage, parse_processes,
    parse_sessions,
};
use crate::state::{now_unix, CpuStat, FailureKind, MetricFailure, Snapshot, SystemResources};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source of snapshots for the refresh cache.
#[async_trait]
pub trait Collect: Send + Sync {
    /// Never fails: anything that goes wrong ends up in `Snapshot::failures`.
    async fn collect(&self) -> Snapshot;
}

/// Stdout of a command, or why there is none.
pub type Outcome = Result<String, MetricFailure>;

/// One cycle's raw command outcomes.
#[derive(Debug, Clone)]
pub struct CommandOutputs {
    pub gpu_query: Outcome,
    pub gpu_processes: Outcome,
    pub memory: Outcome,
    pub root_disk: Outcome,
    pub partitions: Outcome,
    pub cpu_usage: Outcome,
    pub cpu_cores: Outcome,
    pub sessions: Outcome,
    pub processes: Outcome,
    pub home_usage: Outcome,
}

pub struct SnapshotAggregator {
    runner: Arc<CommandRunner>,
    storage_mount_prefixes: Vec<String>,
}

impl SnapshotAggregator {
    pub fn new(runner: Arc<CommandRunner>, storage_mount_prefixes: Vec<String>) -> Self {
        Self {
            runner,
            storage_mount_prefixes,
        }
    }

    async fn run(&self, command: RemoteCommand) -> Outcome {
        self.runner
            .run(command)
            .await
            .map(|result| result.stdout)
            .map_err(|err| MetricFailure {
                metric: command.metric(),
                command: command.name().to_string(),
                kind: err.kind(),
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl Collect for SnapshotAggregator {
    async fn collect(&self) -> Snapshot {
        let captured_at = now_unix();
        if let Err(err) = self.runner.ensure_connected().await {
            return Snapshot::unreachable(captured_at, "connect", &err.to_string());
        }

        let (
            gpu_query,
            gpu_processes,
            memory,
            root_disk,
            partitions,
            cpu_usage,
            cpu_cores,
            sessions,
            processes,
            home_usage,
        ) = tokio::join!(
            self.run(RemoteCommand::GpuQuery),
            self.run(RemoteCommand::GpuProcesses),
            self.run(RemoteCommand::Memory),
            self.run(RemoteCommand::RootDisk),
            self.run(RemoteCommand::Partitions),
            self.run(RemoteCommand::CpuUsage),
            self.run(RemoteCommand::CpuCores),
            self.run(RemoteCommand::Sessions),
            self.run(RemoteCommand::Processes),
            self.run(RemoteCommand::HomeUsage),
        );

        let outputs = CommandOutputs {
            gpu_query,
            gpu_processes,
            memory,
            root_disk,
            partitions,
            cpu_usage,
            cpu_cores,
            sessions,
            processes,
            home_usage,
        };
        let snapshot = assemble(captured_at, &outputs, &self.storage_mount_prefixes);
        debug!(
            gpus = snapshot.gpus.len(),
            users = snapshot.users.len(),
            failures = snapshot.failures.len(),
            "snapshot assembled"
        );
        snapshot
    }
}

/// Keeps the first failure reported for each metric.
#[derive(Default)]
struct FailureLog {
    failures: Vec<MetricFailure>,
}

impl FailureLog {
    fn record(&mut self, failure: MetricFailure) {
        if self.failures.iter().any(|f| f.metric == failure.metric) {
            debug!(metric = %failure.metric, command = %failure.command, error = %failure.message, "additional failure for metric");
            return;
        }
        warn!(
            metric = %failure.metric,
            command = %failure.command,
            kind = ?failure.kind,
            error = %failure.message,
            "metric collection failed"
        );
        self.failures.push(failure);
    }

    fn into_sorted(mut self) -> Vec<MetricFailure> {
        self.failures.sort_by_key(|f| f.metric);
        self.failures
    }
}

fn parsed<T>(
    log: &mut FailureLog,
    command: RemoteCommand,
    outcome: &Outcome,
    parse: impl FnOnce(&str) -> Result<T, ParseError>,
) -> Option<T> {
    match outcome {
        Ok(stdout) => match parse(stdout) {
            Ok(value) => Some(value),
            Err(err) => {
                log.record(MetricFailure {
                    metric: err.metric,
                    command: command.name().to_string(),
                    kind: FailureKind::Parse,
                    message: err.to_string(),
                });
                None
            }
        },
        Err(failure) => {
            log.record(failure.clone());
            None
        }
    }
}

/// Builds a snapshot from one cycle's outcomes. Pure apart from logging.
pub fn assemble(
    captured_at_unix: i64,
    outputs: &CommandOutputs,
    storage_mount_prefixes: &[String],
) -> Snapshot {
    let mut log = FailureLog::default();

    let mut gpus = parsed(&mut log, RemoteCommand::GpuQuery, &outputs.gpu_query, parse_gpus);
    let gpu_apps = parsed(
        &mut log,
        RemoteCommand::GpuProcesses,
        &outputs.gpu_processes,
        parse_gpu_processes,
    )
    // Per-user GPU figures only make sense next to a GPU list.
    .filter(|_| gpus.is_some());

    let memory = parsed(&mut log, RemoteCommand::Memory, &outputs.memory, parse_memory);
    let disk = parsed(&mut log, RemoteCommand::RootDisk, &outputs.root_disk, parse_root_disk);
    let storage_disks = parsed(
        &mut log,
        RemoteCommand::Partitions,
        &outputs.partitions,
        |text| parse_partitions(text, storage_mount_prefixes),
    );
    let cpu_usage = parsed(&mut log, RemoteCommand::CpuUsage, &outputs.cpu_usage, parse_cpu_usage);
    let core_count = parsed(&mut log, RemoteCommand::CpuCores, &outputs.cpu_cores, parse_core_count);

    let sessions = parsed(&mut log, RemoteCommand::Sessions, &outputs.sessions, parse_sessions);
    let processes = parsed(&mut log, RemoteCommand::Processes, &outputs.processes, parse_processes);
    let home_usage = parsed(&mut log, RemoteCommand::HomeUsage, &outputs.home_usage, parse_home_usage);

    if let (Some(gpus), Some(apps), Some(processes)) = (gpus.as_mut(), &gpu_apps, &processes) {
        assign_gpu_users(gpus, apps, processes);
    }

    let users = sessions
        .map(|sessions| {
            merge_users(
                sessions,
                processes.as_deref(),
                gpu_apps.as_deref(),
                home_usage.as_ref(),
            )
        })
        .unwrap_or_default();

    Snapshot {
        captured_at_unix,
        gpus: gpus.unwrap_or_default(),
        users,
        system: SystemResources {
            cpu: cpu_usage.zip(core_count).map(|(usage_percent, core_count)| CpuStat {
                usage_percent,
                core_count,
            }),
            memory,
            disk,
            storage_summary: storage_disks.as_deref().map(summarize_storage),
            storage_disks,
        },
        failures: log.into_sorted(),
    }
}
