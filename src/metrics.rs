//! Prometheus metrics for task lifecycle events.
//!
//! [`AnvilMetrics`] is a [`Tracer`]: add it to the job service and scrape
//! [`AnvilMetrics::encode_text`] from your HTTP layer.

use crate::error::{AnvilError, AnvilResult};
use crate::events::{TaskEvent, TaskEventKind, Tracer};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Task counters and handler duration histograms.
#[derive(Clone)]
pub struct AnvilMetrics {
    registry: Registry,
    events: IntCounterVec,
    handler_duration: HistogramVec,
}

impl std::fmt::Debug for AnvilMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnvilMetrics").finish_non_exhaustive()
    }
}

fn metrics_error(err: prometheus::Error) -> AnvilError {
    AnvilError::config(format!("Failed to set up metrics: {}", err))
}

impl AnvilMetrics {
    /// Create the collectors in a fresh registry, prefixed with `namespace`.
    pub fn new(namespace: &str) -> AnvilResult<Self> {
        let registry = Registry::new();

        let events = IntCounterVec::new(
            Opts::new("task_events_total", "Task lifecycle events").namespace(namespace),
            &["event", "task_type", "queue"],
        )
        .map_err(metrics_error)?;

        let handler_duration = HistogramVec::new(
            HistogramOpts::new("handler_duration_seconds", "Handler execution time")
                .namespace(namespace)
                .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
            &["task_type", "outcome"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(events.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(handler_duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            events,
            handler_duration,
        })
    }

    /// The registry holding the collectors.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of `kind` events seen for a task type on a queue.
    pub fn event_count(&self, kind: TaskEventKind, task_type: &str, queue: &str) -> u64 {
        self.events
            .with_label_values(&[kind.as_str(), task_type, queue])
            .get()
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode_text(&self) -> AnvilResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| AnvilError::config(e.to_string()))
    }
}

impl Tracer for AnvilMetrics {
    fn record(&self, event: &TaskEvent) {
        let kind = event.kind.as_str();
        self.events
            .with_label_values(&[kind, event.task_type.as_str(), event.queue.as_str()])
            .inc();

        if event.kind != TaskEventKind::Leased {
            self.handler_duration
                .with_label_values(&[event.task_type.as_str(), kind])
                .observe(event.duration_ms as f64 / 1000.0);
        }
    }
}
