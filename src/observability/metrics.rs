use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub rides_requested_total: IntCounter,
    pub assignments_total: IntCounterVec,
    pub ride_transitions_total: IntCounterVec,
    pub cache_failures_total: IntCounterVec,
    pub open_ride_requests: IntGauge,
    pub assignment_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let rides_requested_total =
            IntCounter::new("rides_requested_total", "Total ride requests admitted")
                .expect("valid rides_requested_total metric");

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Driver assignment attempts by outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let ride_transitions_total = IntCounterVec::new(
            Opts::new("ride_transitions_total", "Committed ride transitions by target status"),
            &["status"],
        )
        .expect("valid ride_transitions_total metric");

        let cache_failures_total = IntCounterVec::new(
            Opts::new("cache_failures_total", "Swallowed cache failures by operation"),
            &["op"],
        )
        .expect("valid cache_failures_total metric");

        let open_ride_requests =
            IntGauge::new("open_ride_requests", "Ride requests awaiting a driver")
                .expect("valid open_ride_requests metric");

        let assignment_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "assignment_latency_seconds",
                "Latency of driver assignment in seconds",
            ),
            &["outcome"],
        )
        .expect("valid assignment_latency_seconds metric");

        registry
            .register(Box::new(rides_requested_total.clone()))
            .expect("register rides_requested_total");
        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(ride_transitions_total.clone()))
            .expect("register ride_transitions_total");
        registry
            .register(Box::new(cache_failures_total.clone()))
            .expect("register cache_failures_total");
        registry
            .register(Box::new(open_ride_requests.clone()))
            .expect("register open_ride_requests");
        registry
            .register(Box::new(assignment_latency_seconds.clone()))
            .expect("register assignment_latency_seconds");

        Self {
            registry,
            rides_requested_total,
            assignments_total,
            ride_transitions_total,
            cache_failures_total,
            open_ride_requests,
            assignment_latency_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
