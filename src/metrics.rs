use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::error;

/// Prometheus registry for the whole process. Counters are cheap enough to
/// bump unconditionally; scraping is gated by `metrics.enabled`.
pub struct Metrics {
    registry: Registry,
    pub queries: IntCounterVec,
    pub responses: IntCounterVec,
    pub upstream_resolves: IntCounterVec,
    pub upstream_latency: HistogramVec,
    pub doh_responses: IntCounterVec,
    pub cache_entries: IntGauge,
    pub blocked_names: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let queries = IntCounterVec::new(
            Opts::new("vordr_queries_total", "DNS queries received by transport"),
            &["transport"],
        )
        .expect("static metric definition");

        let responses = IntCounterVec::new(
            Opts::new(
                "vordr_responses_total",
                "DNS responses emitted by outcome (custom, blocked, cached, forwarded, servfail)",
            ),
            &["outcome"],
        )
        .expect("static metric definition");

        let upstream_resolves = IntCounterVec::new(
            Opts::new(
                "vordr_upstream_resolves_total",
                "Upstream resolutions by transport and result",
            ),
            &["net", "result"],
        )
        .expect("static metric definition");

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new(
                "vordr_upstream_latency_seconds",
                "Upstream resolution latency by transport",
            ),
            &["net"],
        )
        .expect("static metric definition");

        let doh_responses = IntCounterVec::new(
            Opts::new(
                "vordr_doh_responses_total",
                "DoH server responses by HTTP status",
            ),
            &["status"],
        )
        .expect("static metric definition");

        let cache_entries = IntGauge::new("vordr_cache_entries", "Live response cache entries")
            .expect("static metric definition");

        let blocked_names = IntGauge::new("vordr_blocked_names", "Exact names in the block store")
            .expect("static metric definition");

        for collector in [
            Box::new(queries.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(responses.clone()),
            Box::new(upstream_resolves.clone()),
            Box::new(upstream_latency.clone()),
            Box::new(doh_responses.clone()),
            Box::new(cache_entries.clone()),
            Box::new(blocked_names.clone()),
        ] {
            if let Err(err) = registry.register(collector) {
                error!("failed to register metric: {}", err);
            }
        }

        Self {
            registry,
            queries,
            responses,
            upstream_resolves,
            upstream_latency,
            doh_responses,
            cache_entries,
            blocked_names,
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut out = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut out) {
            error!("failed to encode metrics: {}", err);
        }
        String::from_utf8(out).unwrap_or_default()
    }
}
