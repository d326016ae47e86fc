//! Metrics for [super::TaskQueue].

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for [super::TaskQueue].
#[derive(Default)]
pub(crate) struct Metrics {
    /// Tasks admitted (including tasks run inline by a synchronous queue).
    pub submitted: Counter,
    /// Tasks whose payload has run and been dropped.
    pub executed: Counter,
    /// Tasks whose payload panicked.
    pub panicked: Counter,
    /// Consumers currently executing a payload.
    pub busy: Gauge,
    /// Bytes of the ring currently allocated to records.
    pub used_bytes: Gauge,
}

impl Metrics {
    /// Register all metrics with the given registry.
    pub fn register(&self, registry: &mut Registry) {
        registry.register("submitted", "Tasks admitted", self.submitted.clone());
        registry.register("executed", "Tasks executed", self.executed.clone());
        registry.register("panicked", "Tasks that panicked", self.panicked.clone());
        registry.register("busy", "Consumers executing a task", self.busy.clone());
        registry.register(
            "used_bytes",
            "Bytes of the ring allocated to records",
            self.used_bytes.clone(),
        );
    }
}
