use std::time::Duration;

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Gauge, Histogram, Meter},
};

use crate::utils::metric_name;

/// Metrics sink of the tenant controller, passed in at construction.
pub(crate) trait ControllerMetrics: Send + Sync {
    /// Current number of Tenant objects.
    fn set_tenant_count(&self, count: u64);

    /// A tenant sync completed successfully.
    fn sync_succeeded(&self, client_namespace: &str, duration: Duration);

    fn sync_failed(&self);
}

pub(crate) struct OtelMetrics {
    tenant_count: Gauge<u64>,
    sync_count: Counter<u64>,
    sync_duration: Histogram<u64>,
    sync_errors: Counter<u64>,
}

impl OtelMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            tenant_count: meter
                .u64_gauge(metric_name("tenant_count"))
                .with_description("Number of Tenant objects")
                .build(),
            sync_count: meter
                .u64_counter(metric_name("sync_count"))
                .with_description("Count of successful Tenant syncs")
                .build(),
            sync_duration: meter
                .u64_histogram(metric_name("sync_duration_ms"))
                .with_description("Sync duration of Tenant objects in milliseconds")
                .with_unit("ms")
                .build(),
            sync_errors: meter
                .u64_counter(metric_name("sync_errors"))
                .with_description("Count of failed Tenant syncs")
                .build(),
        }
    }
}

impl ControllerMetrics for OtelMetrics {
    fn set_tenant_count(&self, count: u64) {
        self.tenant_count.record(count, &[]);
    }

    fn sync_succeeded(&self, client_namespace: &str, duration: Duration) {
        let labels = &[KeyValue::new("client_namespace", client_namespace.to_string())];
        self.sync_count.add(1, labels);
        self.sync_duration
            .record(duration.as_millis() as u64, labels);
    }

    fn sync_failed(&self) {
        self.sync_errors.add(1, &[]);
    }
}

/// Metrics sink recording values in memory.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingMetrics {
    pub tenant_count: std::sync::Mutex<Option<u64>>,
    pub successes: std::sync::atomic::AtomicU64,
    pub failures: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl ControllerMetrics for RecordingMetrics {
    fn set_tenant_count(&self, count: u64) {
        *self.tenant_count.lock().unwrap() = Some(count);
    }

    fn sync_succeeded(&self, _client_namespace: &str, _duration: Duration) {
        self.successes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn sync_failed(&self) {
        self.failures
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
