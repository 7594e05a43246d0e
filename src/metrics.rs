use crate::cache::SnapshotView;
use crate::state::{now_unix, Metric, Snapshot};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub gpumond_gpu_count: Gauge,
    pub gpumond_gpu_memory_used_bytes: GaugeVec,
    pub gpumond_gpu_memory_total_bytes: GaugeVec,
    pub gpumond_gpu_memory_usage_percent: GaugeVec,
    pub gpumond_gpu_temperature_celsius: GaugeVec,
    pub gpumond_gpu_power_draw_watts: GaugeVec,
    pub gpumond_cpu_usage_percent: Gauge,
    pub gpumond_cpu_core_count: Gauge,
    pub gpumond_memory_used_bytes: Gauge,
    pub gpumond_memory_total_bytes: Gauge,
    pub gpumond_memory_usage_percent: Gauge,
    pub gpumond_disk_used_bytes: GaugeVec,
    pub gpumond_disk_total_bytes: GaugeVec,
    pub gpumond_disk_usage_percent: GaugeVec,
    pub gpumond_storage_used_bytes: Gauge,
    pub gpumond_storage_total_bytes: Gauge,
    pub gpumond_storage_usage_percent: Gauge,
    pub gpumond_user_count: Gauge,
    pub gpumond_user_cpu_usage_percent: GaugeVec,
    pub gpumond_user_memory_usage_percent: GaugeVec,
    pub gpumond_user_gpu_memory_bytes: GaugeVec,
    pub gpumond_user_storage_bytes: GaugeVec,
    pub gpumond_metric_up: GaugeVec,
    pub gpumond_snapshot_timestamp_seconds: Gauge,
    pub gpumond_snapshot_age_seconds: Gauge,
    pub gpumond_snapshot_stale: Gauge,
    pub gpumond_uptime_seconds: Gauge,
    pub gpumond_collections_total: Counter,
    pub gpumond_collect_errors_total: CounterVec,
    pub gpumond_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let gpumond_gpu_count =
            Gauge::with_opts(opts!("gpumond_gpu_count", "Number of GPUs on the remote host"))?;
        let gpumond_gpu_memory_used_bytes = GaugeVec::new(
            opts!("gpumond_gpu_memory_used_bytes", "GPU memory used in bytes"),
            &["id", "name"],
        )?;
        let gpumond_gpu_memory_total_bytes = GaugeVec::new(
            opts!("gpumond_gpu_memory_total_bytes", "GPU memory total in bytes"),
            &["id", "name"],
        )?;
        let gpumond_gpu_memory_usage_percent = GaugeVec::new(
            opts!(
                "gpumond_gpu_memory_usage_percent",
                "GPU memory usage in percent"
            ),
            &["id", "name"],
        )?;
        let gpumond_gpu_temperature_celsius = GaugeVec::new(
            opts!(
                "gpumond_gpu_temperature_celsius",
                "GPU temperature in Celsius (if reported)"
            ),
            &["id", "name"],
        )?;
        let gpumond_gpu_power_draw_watts = GaugeVec::new(
            opts!(
                "gpumond_gpu_power_draw_watts",
                "GPU power draw in watts (if reported)"
            ),
            &["id", "name"],
        )?;
        let gpumond_cpu_usage_percent = Gauge::with_opts(opts!(
            "gpumond_cpu_usage_percent",
            "Remote CPU busy time in percent (0..100)"
        ))?;
        let gpumond_cpu_core_count =
            Gauge::with_opts(opts!("gpumond_cpu_core_count", "Remote logical CPU count"))?;
        let gpumond_memory_used_bytes =
            Gauge::with_opts(opts!("gpumond_memory_used_bytes", "Remote used memory in bytes"))?;
        let gpumond_memory_total_bytes = Gauge::with_opts(opts!(
            "gpumond_memory_total_bytes",
            "Remote total memory in bytes"
        ))?;
        let gpumond_memory_usage_percent = Gauge::with_opts(opts!(
            "gpumond_memory_usage_percent",
            "Remote memory usage in percent"
        ))?;
        let gpumond_disk_used_bytes = GaugeVec::new(
            opts!("gpumond_disk_used_bytes", "Filesystem used bytes by mount"),
            &["mount"],
        )?;
        let gpumond_disk_total_bytes = GaugeVec::new(
            opts!("gpumond_disk_total_bytes", "Filesystem total bytes by mount"),
            &["mount"],
        )?;
        let gpumond_disk_usage_percent = GaugeVec::new(
            opts!(
                "gpumond_disk_usage_percent",
                "Filesystem usage in percent by mount"
            ),
            &["mount"],
        )?;
        let gpumond_storage_used_bytes = Gauge::with_opts(opts!(
            "gpumond_storage_used_bytes",
            "Used bytes summed over storage disks"
        ))?;
        let gpumond_storage_total_bytes = Gauge::with_opts(opts!(
            "gpumond_storage_total_bytes",
            "Total bytes summed over storage disks"
        ))?;
        let gpumond_storage_usage_percent = Gauge::with_opts(opts!(
            "gpumond_storage_usage_percent",
            "Usage in percent over all storage disks"
        ))?;
        let gpumond_user_count =
            Gauge::with_opts(opts!("gpumond_user_count", "Number of logged-in users"))?;
        let gpumond_user_cpu_usage_percent = GaugeVec::new(
            opts!(
                "gpumond_user_cpu_usage_percent",
                "CPU usage summed over a user's processes"
            ),
            &["user"],
        )?;
        let gpumond_user_memory_usage_percent = GaugeVec::new(
            opts!(
                "gpumond_user_memory_usage_percent",
                "Memory usage summed over a user's processes"
            ),
            &["user"],
        )?;
        let gpumond_user_gpu_memory_bytes = GaugeVec::new(
            opts!(
                "gpumond_user_gpu_memory_bytes",
                "GPU memory held by a user's compute processes"
            ),
            &["user"],
        )?;
        let gpumond_user_storage_bytes = GaugeVec::new(
            opts!(
                "gpumond_user_storage_bytes",
                "Size of a user's home directory in bytes"
            ),
            &["user"],
        )?;
        let gpumond_metric_up = GaugeVec::new(
            opts!(
                "gpumond_metric_up",
                "1 if the metric was collected in the served snapshot, 0 if it failed"
            ),
            &["metric"],
        )?;
        let gpumond_snapshot_timestamp_seconds = Gauge::with_opts(opts!(
            "gpumond_snapshot_timestamp_seconds",
            "Unix time the served snapshot was captured"
        ))?;
        let gpumond_snapshot_age_seconds = Gauge::with_opts(opts!(
            "gpumond_snapshot_age_seconds",
            "Age of the served snapshot in seconds"
        ))?;
        let gpumond_snapshot_stale = Gauge::with_opts(opts!(
            "gpumond_snapshot_stale",
            "1 if the served snapshot is stale"
        ))?;
        let gpumond_uptime_seconds =
            Gauge::with_opts(opts!("gpumond_uptime_seconds", "Collector uptime in seconds"))?;
        let gpumond_collections_total = Counter::with_opts(opts!(
            "gpumond_collections_total",
            "Number of completed collection cycles"
        ))?;
        let gpumond_collect_errors_total = CounterVec::new(
            opts!(
                "gpumond_collect_errors_total",
                "Metric collection failures by metric and kind"
            ),
            &["metric", "kind"],
        )?;
        let gpumond_scrape_count_total = Counter::with_opts(opts!(
            "gpumond_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &gpumond_gpu_count)?;
        register(&registry, &gpumond_gpu_memory_used_bytes)?;
        register(&registry, &gpumond_gpu_memory_total_bytes)?;
        register(&registry, &gpumond_gpu_memory_usage_percent)?;
        register(&registry, &gpumond_gpu_temperature_celsius)?;
        register(&registry, &gpumond_gpu_power_draw_watts)?;
        register(&registry, &gpumond_cpu_usage_percent)?;
        register(&registry, &gpumond_cpu_core_count)?;
        register(&registry, &gpumond_memory_used_bytes)?;
        register(&registry, &gpumond_memory_total_bytes)?;
        register(&registry, &gpumond_memory_usage_percent)?;
        register(&registry, &gpumond_disk_used_bytes)?;
        register(&registry, &gpumond_disk_total_bytes)?;
        register(&registry, &gpumond_disk_usage_percent)?;
        register(&registry, &gpumond_storage_used_bytes)?;
        register(&registry, &gpumond_storage_total_bytes)?;
        register(&registry, &gpumond_storage_usage_percent)?;
        register(&registry, &gpumond_user_count)?;
        register(&registry, &gpumond_user_cpu_usage_percent)?;
        register(&registry, &gpumond_user_memory_usage_percent)?;
        register(&registry, &gpumond_user_gpu_memory_bytes)?;
        register(&registry, &gpumond_user_storage_bytes)?;
        register(&registry, &gpumond_metric_up)?;
        register(&registry, &gpumond_snapshot_timestamp_seconds)?;
        register(&registry, &gpumond_snapshot_age_seconds)?;
        register(&registry, &gpumond_snapshot_stale)?;
        register(&registry, &gpumond_uptime_seconds)?;
        register(&registry, &gpumond_collections_total)?;
        register(&registry, &gpumond_collect_errors_total)?;
        register(&registry, &gpumond_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            gpumond_gpu_count,
            gpumond_gpu_memory_used_bytes,
            gpumond_gpu_memory_total_bytes,
            gpumond_gpu_memory_usage_percent,
            gpumond_gpu_temperature_celsius,
            gpumond_gpu_power_draw_watts,
            gpumond_cpu_usage_percent,
            gpumond_cpu_core_count,
            gpumond_memory_used_bytes,
            gpumond_memory_total_bytes,
            gpumond_memory_usage_percent,
            gpumond_disk_used_bytes,
            gpumond_disk_total_bytes,
            gpumond_disk_usage_percent,
            gpumond_storage_used_bytes,
            gpumond_storage_total_bytes,
            gpumond_storage_usage_percent,
            gpumond_user_count,
            gpumond_user_cpu_usage_percent,
            gpumond_user_memory_usage_percent,
            gpumond_user_gpu_memory_bytes,
            gpumond_user_storage_bytes,
            gpumond_metric_up,
            gpumond_snapshot_timestamp_seconds,
            gpumond_snapshot_age_seconds,
            gpumond_snapshot_stale,
            gpumond_uptime_seconds,
            gpumond_collections_total,
            gpumond_collect_errors_total,
            gpumond_scrape_count_total,
        }))
    }

    /// Counts one finished collection and the failures it carried.
    pub fn observe_collection(&self, snapshot: &Snapshot) {
        self.gpumond_collections_total.inc();
        for failure in &snapshot.failures {
            self.gpumond_collect_errors_total
                .with_label_values(&[failure.metric.as_str(), failure.kind.as_str()])
                .inc();
        }
    }

    /// Mirrors the served snapshot. Gauges of a metric that failed keep their
    /// previous value; `gpumond_metric_up` tells them apart.
    pub fn update_from_view(&self, view: &SnapshotView) {
        let snapshot = &view.snapshot;

        self.gpumond_snapshot_stale
            .set(if view.is_stale { 1.0 } else { 0.0 });
        self.gpumond_uptime_seconds
            .set(now_unix().saturating_sub(self.started_at_unix) as f64);
        // Nothing collected yet.
        if snapshot.captured_at_unix <= 0 {
            return;
        }

        for metric in Metric::ALL {
            let up = if snapshot.failure(metric).is_some() { 0.0 } else { 1.0 };
            self.gpumond_metric_up
                .with_label_values(&[metric.as_str()])
                .set(up);
        }

        self.gpumond_snapshot_timestamp_seconds
            .set(snapshot.captured_at_unix as f64);
        self.gpumond_snapshot_age_seconds
            .set(now_unix().saturating_sub(snapshot.captured_at_unix).max(0) as f64);

        if snapshot.failure(Metric::Gpu).is_none() {
            self.gpumond_gpu_memory_used_bytes.reset();
            self.gpumond_gpu_memory_total_bytes.reset();
            self.gpumond_gpu_memory_usage_percent.reset();
            self.gpumond_gpu_temperature_celsius.reset();
            self.gpumond_gpu_power_draw_watts.reset();
            for g in &snapshot.gpus {
                let labels = [g.id.as_str(), g.name.as_str()];
                self.gpumond_gpu_memory_used_bytes
                    .with_label_values(&labels)
                    .set(g.memory_used_mib as f64 * MIB);
                self.gpumond_gpu_memory_total_bytes
                    .with_label_values(&labels)
                    .set(g.memory_total_mib as f64 * MIB);
                self.gpumond_gpu_memory_usage_percent
                    .with_label_values(&labels)
                    .set(g.memory_usage_percent);
                if let Some(t) = g.temperature_celsius {
                    self.gpumond_gpu_temperature_celsius
                        .with_label_values(&labels)
                        .set(t);
                }
                if let Some(w) = g.power_draw_watts {
                    self.gpumond_gpu_power_draw_watts
                        .with_label_values(&labels)
                        .set(w);
                }
            }
            self.gpumond_gpu_count.set(snapshot.gpus.len() as f64);
        }

        let system = &snapshot.system;
        if let Some(cpu) = &system.cpu {
            self.gpumond_cpu_usage_percent.set(cpu.usage_percent);
            self.gpumond_cpu_core_count.set(cpu.core_count as f64);
        }
        if let Some(mem) = &system.memory {
            self.gpumond_memory_used_bytes.set(mem.used_bytes as f64);
            self.gpumond_memory_total_bytes.set(mem.total_bytes as f64);
            self.gpumond_memory_usage_percent.set(mem.usage_percent);
        }

        if system.disk.is_some() || system.storage_disks.is_some() {
            self.gpumond_disk_used_bytes.reset();
            self.gpumond_disk_total_bytes.reset();
            self.gpumond_disk_usage_percent.reset();
        }
        let root = system.disk.iter().map(|d| ("/", d.used_bytes, d.total_bytes, d.usage_percent));
        let storage = system.storage_disks.iter().flatten().map(|d| {
            (
                d.mount_point.as_str(),
                d.used_bytes,
                d.total_bytes,
                d.usage_percent,
            )
        });
        for (mount, used, total, pct) in root.chain(storage) {
            self.gpumond_disk_used_bytes
                .with_label_values(&[mount])
                .set(used as f64);
            self.gpumond_disk_total_bytes
                .with_label_values(&[mount])
                .set(total as f64);
            self.gpumond_disk_usage_percent
                .with_label_values(&[mount])
                .set(pct);
        }
        if let Some(summary) = &system.storage_summary {
            self.gpumond_storage_used_bytes.set(summary.used_bytes as f64);
            self.gpumond_storage_total_bytes.set(summary.total_bytes as f64);
            self.gpumond_storage_usage_percent.set(summary.usage_percent);
        }

        if snapshot.failure(Metric::Users).is_none() || !snapshot.users.is_empty() {
            self.gpumond_user_cpu_usage_percent.reset();
            self.gpumond_user_memory_usage_percent.reset();
            self.gpumond_user_gpu_memory_bytes.reset();
            self.gpumond_user_storage_bytes.reset();
            for u in &snapshot.users {
                let user = [u.username.as_str()];
                if let Some(cpu) = u.cpu_usage_percent {
                    self.gpumond_user_cpu_usage_percent
                        .with_label_values(&user)
                        .set(cpu);
                }
                if let Some(mem) = u.memory_usage_percent {
                    self.gpumond_user_memory_usage_percent
                        .with_label_values(&user)
                        .set(mem);
                }
                if let Some(gpu) = u.gpu_memory_mib {
                    self.gpumond_user_gpu_memory_bytes
                        .with_label_values(&user)
                        .set(gpu as f64 * MIB);
                }
                if let Some(bytes) = u.storage_bytes {
                    self.gpumond_user_storage_bytes
                        .with_label_values(&user)
                        .set(bytes as f64);
                }
            }
            self.gpumond_user_count.set(snapshot.users.len() as f64);
        }
    }

    pub fn inc_scrape_count(&self) {
        self.gpumond_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::healthy;
    use crate::state::Snapshot;

    fn view(snapshot: Snapshot, is_stale: bool) -> SnapshotView {
        SnapshotView {
            snapshot: Arc::new(snapshot),
            is_stale,
            last_error: None,
        }
    }

    fn encoded(metrics: &Metrics) -> String {
        String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8")
    }

    #[test]
    fn healthy_snapshot_is_mirrored() {
        let metrics = Metrics::new().expect("metrics");
        metrics.update_from_view(&view(healthy(1_700_000_000), false));

        assert_eq!(metrics.gpumond_gpu_count.get(), 1.0);
        assert_eq!(
            metrics
                .gpumond_gpu_memory_used_bytes
                .with_label_values(&["0", "Tesla T4"])
                .get(),
            1024.0 * MIB
        );
        assert_eq!(metrics.gpumond_cpu_usage_percent.get(), 12.5);
        assert_eq!(metrics.gpumond_snapshot_stale.get(), 0.0);
        assert_eq!(
            metrics.gpumond_metric_up.with_label_values(&["gpu"]).get(),
            1.0
        );
        assert!(encoded(&metrics).contains("gpumond_gpu_power_draw_watts"));
    }

    #[test]
    fn failed_gpu_keeps_previous_gauges() {
        let metrics = Metrics::new().expect("metrics");
        metrics.update_from_view(&view(healthy(1), false));

        let unreachable = Snapshot::unreachable(2, "connect", "Connection refused");
        metrics.observe_collection(&unreachable);
        metrics.update_from_view(&view(unreachable, true));

        assert_eq!(metrics.gpumond_gpu_count.get(), 1.0);
        assert_eq!(
            metrics.gpumond_metric_up.with_label_values(&["gpu"]).get(),
            0.0
        );
        assert_eq!(metrics.gpumond_snapshot_stale.get(), 1.0);
        assert_eq!(
            metrics
                .gpumond_collect_errors_total
                .with_label_values(&["gpu", "connection"])
                .get(),
            1.0
        );
        assert_eq!(metrics.gpumond_collections_total.get(), 1.0);
    }
}
