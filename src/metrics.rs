//! Driver Metrics
//!
//! Prometheus counters for one backend, registered into a private
//! [`Registry`] so several backends can live in one process.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "ontap_driver";

/// Counters recorded by the control-plane operations of one backend
#[derive(Clone)]
pub struct DriverMetrics {
    registry: Registry,
    /// Export rules created / deleted by reconciliation
    pub export_rules: IntCounterVec,
    /// Initiators added to / removed from the igroup
    pub initiators: IntCounterVec,
    pub clones_created: IntCounter,
    /// Existence probes issued after job-tracking failures
    pub probe_attempts: IntCounter,
    pub busy_snapshot_splits: IntCounter,
    /// Requests turned away by admission control, by reason
    pub admission_rejections: IntCounterVec,
}

impl DriverMetrics {
    pub fn new(backend: &str) -> Result<Self> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(NAMESPACE)
                .const_label("backend", backend)
        };

        let export_rules = IntCounterVec::new(
            opts("export_rules_total", "Export rules changed by reconciliation"),
            &["op"],
        )
        .map_err(metrics_error)?;
        let initiators = IntCounterVec::new(
            opts("igroup_initiators_total", "Initiators changed by reconciliation"),
            &["op"],
        )
        .map_err(metrics_error)?;
        let clones_created = IntCounter::with_opts(opts("clones_created_total", "Clones created"))
            .map_err(metrics_error)?;
        let probe_attempts = IntCounter::with_opts(opts(
            "probe_attempts_total",
            "Volume existence probes after job tracking failures",
        ))
        .map_err(metrics_error)?;
        let busy_snapshot_splits = IntCounter::with_opts(opts(
            "busy_snapshot_splits_total",
            "Snapshot deletions refused as busy, each starting one clone split",
        ))
        .map_err(metrics_error)?;
        let admission_rejections = IntCounterVec::new(
            opts("admission_rejections_total", "Requests rejected by admission control"),
            &["reason"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(export_rules.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(initiators.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(clones_created.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(probe_attempts.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(busy_snapshot_splits.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(admission_rejections.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            export_rules,
            initiators,
            clones_created,
            probe_attempts,
            busy_snapshot_splits,
            admission_rejections,
        })
    }

    #[inline]
    pub fn record_export_rules(&self, added: usize, removed: usize) {
        self.export_rules.with_label_values(&["add"]).inc_by(added as u64);
        self.export_rules.with_label_values(&["remove"]).inc_by(removed as u64);
    }

    #[inline]
    pub fn record_initiators(&self, added: usize, removed: usize) {
        self.initiators.with_label_values(&["add"]).inc_by(added as u64);
        self.initiators.with_label_values(&["remove"]).inc_by(removed as u64);
    }

    #[inline]
    pub fn record_rejection(&self, reason: &str) {
        self.admission_rejections.with_label_values(&[reason]).inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all counters in the Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
    }
}

impl std::fmt::Debug for DriverMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverMetrics")
            .field("clones_created", &self.clones_created.get())
            .field("probe_attempts", &self.probe_attempts.get())
            .field("busy_snapshot_splits", &self.busy_snapshot_splits.get())
            .finish()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_per_backend() {
        let a = DriverMetrics::new("backend-a").unwrap();
        let b = DriverMetrics::new("backend-b").unwrap();

        a.record_export_rules(2, 1);
        a.clones_created.inc();

        assert_eq!(a.export_rules.with_label_values(&["add"]).get(), 2);
        assert_eq!(b.export_rules.with_label_values(&["add"]).get(), 0);

        let text = a.encode_text().unwrap();
        assert!(text.contains("ontap_driver_clones_created_total"));
        assert!(text.contains("backend=\"backend-a\""));
    }
}
