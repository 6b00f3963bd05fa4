//! Metrics façade.
//!
//! A thin wrapper over [`prometheus::Registry`] so the rest of the crate
//! talks in terms of named counters and gauges instead of the registry API
//! directly. Every pipeline stage registers the same fixed set of metrics
//! under a `stage` label so they aggregate cleanly across a running
//! process.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use crate::error::Error;

fn now_unix_seconds() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or_default()
}

/// Owns the process-wide [`Registry`] and the handles to the metrics this
/// crate itself publishes. Application code can register additional
/// metrics against the same [`Registry`] via [`MetricsRegistry::registry`].
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    inner: Arc<Metrics>,
}

struct Metrics {
    services_running: Gauge,
    services_failed: CounterVec,
    pipeline_items_processed: CounterVec,
    pipeline_items_failed: CounterVec,
    pipeline_stage_latency_sum_seconds: CounterVec,
    pipeline_runs: CounterVec,
    pipeline_context_expired: CounterVec,
    pipeline_ping_pong: CounterVec,
    consecutive_success: GaugeVec,
    consecutive_failure: GaugeVec,
    consecutive_expired: GaugeVec,
    last_success_time: GaugeVec,
    last_failure_time: GaugeVec,
    last_expired_time: GaugeVec,
    last_ping_success_time: GaugeVec,
}

impl MetricsRegistry {
    /// Builds a fresh registry and registers this crate's own metrics
    /// against it. Returns [`Error::ConfigInvalid`] only if a metric with a
    /// colliding name was already registered, which cannot happen on a
    /// freshly constructed registry.
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new();

        let services_running = Gauge::new(
            "svc_services_running",
            "Number of registered services currently in the Running state",
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let services_failed = CounterVec::new(
            Opts::new(
                "svc_services_failed_total",
                "Number of services that transitioned to Failed, by service key",
            ),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let pipeline_items_processed = CounterVec::new(
            Opts::new(
                "svc_pipeline_items_processed_total",
                "Work items a pipeline stage has completed, by stage",
            ),
            &["stage"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let pipeline_items_failed = CounterVec::new(
            Opts::new(
                "svc_pipeline_items_failed_total",
                "Work items a pipeline stage's command returned an error for, by stage",
            ),
            &["stage"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let pipeline_stage_latency_sum_seconds = CounterVec::new(
            Opts::new(
                "svc_pipeline_stage_latency_seconds_sum",
                "Cumulative wall-clock time a stage's command has spent executing, by stage",
            ),
            &["stage"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        registry
            .register(Box::new(services_running.clone()))
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        registry
            .register(Box::new(services_failed.clone()))
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        registry
            .register(Box::new(pipeline_items_processed.clone()))
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        registry
            .register(Box::new(pipeline_items_failed.clone()))
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        registry
            .register(Box::new(pipeline_stage_latency_sum_seconds.clone()))
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let pipeline_runs = CounterVec::new(
            Opts::new(
                "svc_pipeline_runs_total",
                "Work items that entered a pipeline at stage one, by owning service",
            ),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let pipeline_context_expired = CounterVec::new(
            Opts::new(
                "svc_pipeline_context_expired_total",
                "Work items dropped for a crossed deadline or cancellation, by owning service",
            ),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let pipeline_ping_pong = CounterVec::new(
            Opts::new(
                "svc_pipeline_ping_pong_total",
                "Liveness probes answered by a pipeline stage, by owning service",
            ),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        registry
            .register(Box::new(pipeline_runs.clone()))
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        registry
            .register(Box::new(pipeline_context_expired.clone()))
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        registry
            .register(Box::new(pipeline_ping_pong.clone()))
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let consecutive_success = GaugeVec::new(
            Opts::new(
                "svc_pipeline_consecutive_success",
                "Consecutive successful terminal deliveries, by owning service",
            ),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let consecutive_failure = GaugeVec::new(
            Opts::new(
                "svc_pipeline_consecutive_failure",
                "Consecutive failed terminal deliveries, by owning service",
            ),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let consecutive_expired = GaugeVec::new(
            Opts::new(
                "svc_pipeline_consecutive_expired",
                "Consecutive expired terminal deliveries, by owning service",
            ),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let last_success_time = GaugeVec::new(
            Opts::new("svc_pipeline_last_success_time_seconds", "Unix time of the last successful delivery"),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let last_failure_time = GaugeVec::new(
            Opts::new("svc_pipeline_last_failure_time_seconds", "Unix time of the last failed delivery"),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let last_expired_time = GaugeVec::new(
            Opts::new("svc_pipeline_last_expired_time_seconds", "Unix time of the last expired delivery"),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let last_ping_success_time = GaugeVec::new(
            Opts::new("svc_pipeline_last_ping_success_time_seconds", "Unix time of the last answered ping"),
            &["service"],
        )
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        for metric in [
            &consecutive_success,
            &consecutive_failure,
            &consecutive_expired,
            &last_success_time,
            &last_failure_time,
            &last_expired_time,
            &last_ping_success_time,
        ] {
            registry.register(Box::new(metric.clone())).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        }

        Ok(Self {
            registry,
            inner: Arc::new(Metrics {
                services_running,
                services_failed,
                pipeline_items_processed,
                pipeline_items_failed,
                pipeline_stage_latency_sum_seconds,
                pipeline_runs,
                pipeline_context_expired,
                pipeline_ping_pong,
                consecutive_success,
                consecutive_failure,
                consecutive_expired,
                last_success_time,
                last_failure_time,
                last_expired_time,
                last_ping_success_time,
            }),
        })
    }

    /// The underlying registry, for application code that wants to
    /// register its own metrics alongside this crate's.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn service_started(&self) {
        self.inner.services_running.inc();
    }

    pub fn service_stopped(&self) {
        self.inner.services_running.dec();
    }

    pub fn service_failed(&self, service_key: &str) {
        self.inner.services_failed.with_label_values(&[service_key]).inc();
        self.inner.services_running.dec();
    }

    pub fn stage_item_processed(&self, stage: &str) {
        self.inner.pipeline_items_processed.with_label_values(&[stage]).inc();
    }

    pub fn stage_item_failed(&self, stage: &str) {
        self.inner.pipeline_items_failed.with_label_values(&[stage]).inc();
    }

    pub fn stage_latency_observed(&self, stage: &str, seconds: f64) {
        self.inner
            .pipeline_stage_latency_sum_seconds
            .with_label_values(&[stage])
            .inc_by(seconds);
    }

    /// Counted once per item, when it is dequeued by the first stage -
    /// `run_count` in spec terms, not to be confused with a per-stage count.
    pub fn pipeline_run_started(&self, service: &str) {
        self.inner.pipeline_runs.with_label_values(&[service]).inc();
    }

    pub fn pipeline_item_expired(&self, service: &str) {
        self.inner.pipeline_context_expired.with_label_values(&[service]).inc();
    }

    pub fn pipeline_ping_replied(&self, service: &str) {
        self.inner.pipeline_ping_pong.with_label_values(&[service]).inc();
        self.inner.last_ping_success_time.with_label_values(&[service]).set(now_unix_seconds());
    }

    /// Records a successful terminal delivery: bumps `consecutive_success`,
    /// resets `consecutive_failure`/`consecutive_expired`, and stamps
    /// `last_success_time`, per spec.md §4.4's terminal-stage bookkeeping.
    pub fn terminal_success(&self, service: &str) {
        self.inner.consecutive_success.with_label_values(&[service]).inc();
        self.inner.consecutive_failure.with_label_values(&[service]).set(0.0);
        self.inner.consecutive_expired.with_label_values(&[service]).set(0.0);
        self.inner.last_success_time.with_label_values(&[service]).set(now_unix_seconds());
    }

    /// Records a failed terminal delivery: bumps `consecutive_failure`,
    /// resets `consecutive_success`, and stamps `last_failure_time`.
    pub fn terminal_failure(&self, service: &str) {
        self.inner.consecutive_failure.with_label_values(&[service]).inc();
        self.inner.consecutive_success.with_label_values(&[service]).set(0.0);
        self.inner.last_failure_time.with_label_values(&[service]).set(now_unix_seconds());
    }

    /// Records a terminal delivery dropped for expiry: bumps
    /// `consecutive_expired`, resets `consecutive_success`, and stamps
    /// `last_expired_time`.
    pub fn terminal_expired(&self, service: &str) {
        self.inner.consecutive_expired.with_label_values(&[service]).inc();
        self.inner.consecutive_success.with_label_values(&[service]).set(0.0);
        self.inner.last_expired_time.with_label_values(&[service]).set(now_unix_seconds());
    }

    /// Renders the registry in Prometheus text exposition format, for a
    /// `/metrics` endpoint.
    pub fn render(&self) -> Result<String, Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| Error::ConfigInvalid(e.to_string()))
    }
}

/// A single named counter, for application code that wants its own metric
/// without going through [`MetricsRegistry`]'s fixed set.
#[must_use]
pub fn counter(name: &str, help: &str) -> Result<Counter, Error> {
    Counter::new(name, help).map_err(|e| Error::ConfigInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_registry_constructs() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.service_started();
        metrics.stage_item_processed("decode");
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("svc_services_running"));
        assert!(rendered.contains("svc_pipeline_items_processed_total"));
    }

    #[test]
    fn service_failed_decrements_running_and_counts_by_key() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.service_started();
        metrics.service_started();
        metrics.service_failed("svc::Clock");
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("svc_services_failed_total"));
    }

    #[test]
    fn terminal_success_resets_failure_and_expired_streaks() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.terminal_failure("1");
        metrics.terminal_failure("1");
        metrics.terminal_success("1");
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("svc_pipeline_consecutive_success{service=\"1\"} 1"));
        assert!(rendered.contains("svc_pipeline_consecutive_failure{service=\"1\"} 0"));
    }

    #[test]
    fn terminal_failure_resets_success_streak() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.terminal_success("1");
        metrics.terminal_failure("1");
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("svc_pipeline_consecutive_failure{service=\"1\"} 1"));
        assert!(rendered.contains("svc_pipeline_consecutive_success{service=\"1\"} 0"));
    }
}
