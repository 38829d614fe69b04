use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct SyncMetrics {
    syncs: Counter,
    duration: Histogram,
    routes: Gauge,
    route_errors: Counter,
    objects: Gauge,
}

// === impl SyncMetrics ===

impl SyncMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register("passes", "Count of completed sync passes", metrics.syncs.clone());
        reg.register_with_unit(
            "duration",
            "Histogram of sync pass durations",
            Unit::Seconds,
            metrics.duration.clone(),
        );
        reg.register(
            "routes",
            "Number of routes reconciled by the last sync pass",
            metrics.routes.clone(),
        );
        reg.register(
            "route_errors",
            "Count of routes that could not be reconciled",
            metrics.route_errors.clone(),
        );
        reg.register(
            "objects",
            "Number of objects the route reconciler maintains across hubs",
            metrics.objects.clone(),
        );
        metrics
    }

    pub(crate) fn observe(
        &self,
        elapsed: time::Duration,
        routes: usize,
        errors: usize,
        objects: usize,
    ) {
        self.syncs.inc();
        self.duration.observe(elapsed.as_secs_f64());
        self.routes.set(i64::try_from(routes).unwrap_or(i64::MAX));
        self.route_errors.inc_by(errors as u64);
        self.objects.set(i64::try_from(objects).unwrap_or(i64::MAX));
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            syncs: Counter::default(),
            duration: Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            routes: Gauge::default(),
            route_errors: Counter::default(),
            objects: Gauge::default(),
        }
    }
}
