//! Prometheus metrics of the dispatcher.

use anyhow::{Context, Result};
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct DispatchMetrics {
    registry: Registry,
    pub queue_depth: IntGauge,
    pub dispatched_files: IntCounter,
    pub broken_files: IntCounter,
    pub event_to_dispatch_seconds: Gauge,
    pub conversion_seconds: Gauge,
    pub commit_seconds: Gauge,
    pub end_to_end_latency_seconds: Gauge,
    pub signals_processed: IntCounter,
}

impl DispatchMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let queue_depth = IntGauge::new("datapool_queue_depth", "Events waiting for dispatch")?;
        let dispatched_files =
            IntCounter::new("datapool_dispatched_files_total", "Raw files dispatched")?;
        let broken_files = IntCounter::new(
            "datapool_broken_files_total",
            "Raw files backed up as broken",
        )?;
        let event_to_dispatch_seconds = Gauge::new(
            "datapool_event_to_dispatch_seconds",
            "Seconds between detection and dispatch of the last raw file",
        )?;
        let conversion_seconds = Gauge::new(
            "datapool_conversion_seconds",
            "Conversion time of the last raw file",
        )?;
        let commit_seconds = Gauge::new(
            "datapool_commit_seconds",
            "Validation and commit time of the last raw file",
        )?;
        let end_to_end_latency_seconds = Gauge::new(
            "datapool_end_to_end_latency_seconds",
            "Seconds from raw file modification until it was handled",
        )?;
        let signals_processed = IntCounter::new(
            "datapool_signals_processed_total",
            "Signals committed to the database",
        )?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(dispatched_files.clone()))?;
        registry.register(Box::new(broken_files.clone()))?;
        registry.register(Box::new(event_to_dispatch_seconds.clone()))?;
        registry.register(Box::new(conversion_seconds.clone()))?;
        registry.register(Box::new(commit_seconds.clone()))?;
        registry.register(Box::new(end_to_end_latency_seconds.clone()))?;
        registry.register(Box::new(signals_processed.clone()))?;

        Ok(Self {
            registry,
            queue_depth,
            dispatched_files,
            broken_files,
            event_to_dispatch_seconds,
            conversion_seconds,
            commit_seconds,
            end_to_end_latency_seconds,
            signals_processed,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("metrics are not utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_all_metric_families() {
        let metrics = DispatchMetrics::new().expect("metrics");
        metrics.queue_depth.set(3);
        metrics.signals_processed.inc_by(2);
        metrics.end_to_end_latency_seconds.set(0.25);
        let text = metrics.render().expect("render");
        assert!(text.contains("datapool_queue_depth 3"));
        assert!(text.contains("datapool_signals_processed_total 2"));
        assert!(text.contains("datapool_end_to_end_latency_seconds 0.25"));
        assert!(text.contains("datapool_dispatched_files_total 0"));
        assert!(text.contains("# TYPE datapool_conversion_seconds gauge"));
    }
}
