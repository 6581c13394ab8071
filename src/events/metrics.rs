//! Storage Metrics
//!
//! Prometheus collectors for the node's storage state. Capacity gauges are
//! fed by acting as a [`CapacitySink`]; the event counter drains its own bus
//! subscription; the reconciler records pass durations directly.

use crate::domain::ports::CapacitySink;
use crate::domain::types::NodeCapacity;
use crate::error::{Error, Result};
use crate::events::bus::{EventBus, VolumeEvent};
use async_trait::async_trait;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const NAMESPACE: &str = "local_storage";

/// Collectors registered in a private registry
pub struct StorageMetrics {
    registry: Registry,
    vg_total_bytes: IntGaugeVec,
    vg_free_bytes: IntGaugeVec,
    raw_free_bytes: IntGaugeVec,
    events_total: IntCounterVec,
    reconcile_passes_total: IntCounter,
    reconcile_duration_seconds: HistogramVec,
}

fn prom(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

impl StorageMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let vg_total_bytes = IntGaugeVec::new(
            Opts::new("vg_total_bytes", "Volume group size in bytes").namespace(NAMESPACE),
            &["vg"],
        )
        .map_err(prom)?;
        let vg_free_bytes = IntGaugeVec::new(
            Opts::new("vg_free_bytes", "Unallocated volume group bytes").namespace(NAMESPACE),
            &["vg"],
        )
        .map_err(prom)?;
        let raw_free_bytes = IntGaugeVec::new(
            Opts::new("raw_free_bytes", "Unpartitioned bytes on a raw disk").namespace(NAMESPACE),
            &["disk"],
        )
        .map_err(prom)?;
        let events_total = IntCounterVec::new(
            Opts::new("events_total", "Volume events by trigger").namespace(NAMESPACE),
            &["trigger"],
        )
        .map_err(prom)?;
        let reconcile_passes_total = IntCounter::with_opts(
            Opts::new("reconcile_passes_total", "Completed reconciliation passes")
                .namespace(NAMESPACE),
        )
        .map_err(prom)?;
        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Reconciliation pass duration")
                .namespace(NAMESPACE)
                .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["result"],
        )
        .map_err(prom)?;

        registry.register(Box::new(vg_total_bytes.clone())).map_err(prom)?;
        registry.register(Box::new(vg_free_bytes.clone())).map_err(prom)?;
        registry.register(Box::new(raw_free_bytes.clone())).map_err(prom)?;
        registry.register(Box::new(events_total.clone())).map_err(prom)?;
        registry.register(Box::new(reconcile_passes_total.clone())).map_err(prom)?;
        registry
            .register(Box::new(reconcile_duration_seconds.clone()))
            .map_err(prom)?;

        Ok(Arc::new(Self {
            registry,
            vg_total_bytes,
            vg_free_bytes,
            raw_free_bytes,
            events_total,
            reconcile_passes_total,
            reconcile_duration_seconds,
        }))
    }

    pub fn record_event(&self, event: &VolumeEvent) {
        self.events_total
            .with_label_values(&[event.trigger.as_str()])
            .inc();
    }

    /// Record one reconciliation pass
    pub fn observe_reconcile(&self, elapsed: Duration, ok: bool) {
        self.reconcile_passes_total.inc();
        let result = if ok { "ok" } else { "error" };
        self.reconcile_duration_seconds
            .with_label_values(&[result])
            .observe(elapsed.as_secs_f64());
    }

    pub fn reconcile_passes(&self) -> u64 {
        self.reconcile_passes_total.get()
    }

    /// Text exposition of every collector
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Subscribe now and count events on a background task
    pub fn spawn(self: Arc<Self>, events: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let rx = events.subscribe();
        tokio::spawn(async move { self.run(rx, shutdown).await })
    }

    async fn run(&self, mut rx: broadcast::Receiver<VolumeEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => self.record_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Metrics subscription lagged, events not counted");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Metrics collector stopped");
    }
}

#[async_trait]
impl CapacitySink for StorageMetrics {
    async fn publish(&self, capacity: &NodeCapacity) -> Result<()> {
        // Pools that disappeared must not keep their last value.
        self.vg_total_bytes.reset();
        self.vg_free_bytes.reset();
        self.raw_free_bytes.reset();

        for (name, group) in &capacity.groups {
            self.vg_total_bytes
                .with_label_values(&[name.as_str()])
                .set(group.total_bytes as i64);
            self.vg_free_bytes
                .with_label_values(&[name.as_str()])
                .set(group.free_bytes as i64);
        }
        for (disk, raw) in &capacity.raw_disks {
            self.raw_free_bytes
                .with_label_values(&[disk.as_str()])
                .set(raw.free_bytes as i64);
        }
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "prometheus"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::GroupCapacity;
    use crate::events::bus::Trigger;

    #[tokio::test]
    async fn test_capacity_gauges() {
        let metrics = StorageMetrics::new().unwrap();
        let mut capacity = NodeCapacity::default();
        capacity.groups.insert(
            "hdd".into(),
            GroupCapacity {
                total_bytes: 1000,
                free_bytes: 400,
                pv_count: 1,
                lv_count: 0,
            },
        );
        metrics.publish(&capacity).await.unwrap();

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"local_storage_vg_total_bytes{vg="hdd"} 1000"#));
        assert!(text.contains(r#"local_storage_vg_free_bytes{vg="hdd"} 400"#));

        metrics.publish(&NodeCapacity::default()).await.unwrap();
        assert!(!metrics.render().unwrap().contains(r#"vg="hdd""#));
    }

    #[tokio::test]
    async fn test_counts_events_from_bus() {
        let bus = EventBus::new();
        let metrics = StorageMetrics::new().unwrap();
        let shutdown = CancellationToken::new();
        let handle = metrics.clone().spawn(&bus, shutdown.clone());

        bus.publish(Trigger::VolumeCreated, "v1");
        bus.publish(Trigger::VolumeCreated, "v2");
        bus.publish(Trigger::DiskAdded, "/dev/sdb");

        for _ in 0..50 {
            if metrics.render().unwrap().contains("disk_added") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let text = metrics.render().unwrap();
        assert!(text.contains(r#"local_storage_events_total{trigger="volume_created"} 2"#));
        assert!(text.contains(r#"local_storage_events_total{trigger="disk_added"} 1"#));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_reconcile_passes() {
        let metrics = StorageMetrics::new().unwrap();
        metrics.observe_reconcile(Duration::from_millis(20), true);
        metrics.observe_reconcile(Duration::from_millis(30), false);
        assert_eq!(metrics.reconcile_passes(), 2);
        assert!(metrics
            .render()
            .unwrap()
            .contains("local_storage_reconcile_duration_seconds_count{result=\"error\"} 1"));
    }
}
