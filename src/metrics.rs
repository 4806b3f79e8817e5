//! Prometheus metrics for the completion engine.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** serving any
//! request. The helper functions (`record_stage_latency`, `inc_request`, …)
//! are no-ops if `init_metrics` was never called, so the engine is always
//! safe to run and observability simply degrades.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `completion_requests_total` | Counter | `outcome` |
//! | `completion_errors_total` | Counter | `kind` |
//! | `completion_stage_duration_seconds` | Histogram | `stage` |
//! | `model_cache_events_total` | Counter | `event` |
//! | `model_selection_total` | Counter | `tier`, `fallback` |
//! | `worker_pool_restarts_total` | Counter | |
//! | `worker_pool_available` | Gauge | |
//! | `generated_tokens_total` | Counter | |

use crate::OrchestratorError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the engine, stored in a single [`OnceLock`].
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Completed requests by outcome (`completion` / `error`).
    pub requests_total: CounterVec,
    /// Errors by taxonomy kind.
    pub errors_total: CounterVec,
    /// Per-stage latency histogram.
    pub stage_duration: HistogramVec,
    /// Model cache hits, misses and evictions.
    pub cache_events: CounterVec,
    /// Router decisions by selected tier and whether a fallback happened.
    pub model_selection: CounterVec,
    /// Worker respawns.
    pub worker_restarts: IntCounter,
    /// Idle workers right now.
    pub workers_available: IntGauge,
    /// Tokens emitted by the decode loop.
    pub generated_tokens: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_err(e: prometheus::Error) -> OrchestratorError {
    OrchestratorError::Other(format!("metrics init failed: {e}"))
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, OrchestratorError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = register(
        &registry,
        CounterVec::new(
            Opts::new("completion_requests_total", "Completion requests by outcome"),
            &["outcome"],
        )
        .map_err(init_err)?,
    )?;

    let errors_total = register(
        &registry,
        CounterVec::new(
            Opts::new("completion_errors_total", "Completion errors by kind"),
            &["kind"],
        )
        .map_err(init_err)?,
    )?;

    let stage_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "completion_stage_duration_seconds",
                "Processing duration per decode-pipeline stage",
            ),
            &["stage"],
        )
        .map_err(init_err)?,
    )?;

    let cache_events = register(
        &registry,
        CounterVec::new(
            Opts::new("model_cache_events_total", "Model cache hits, misses and evictions"),
            &["event"],
        )
        .map_err(init_err)?,
    )?;

    let model_selection = register(
        &registry,
        CounterVec::new(
            Opts::new("model_selection_total", "Router decisions by tier"),
            &["tier", "fallback"],
        )
        .map_err(init_err)?,
    )?;

    let worker_restarts = register(
        &registry,
        IntCounter::new("worker_pool_restarts_total", "Tokenizer worker respawns")
            .map_err(init_err)?,
    )?;

    let workers_available = register(
        &registry,
        IntGauge::new("worker_pool_available", "Idle tokenizer workers").map_err(init_err)?,
    )?;

    let generated_tokens = register(
        &registry,
        IntCounter::new("generated_tokens_total", "Tokens emitted by the decode loop")
            .map_err(init_err)?,
    )?;

    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(Metrics {
        registry,
        requests_total,
        errors_total,
        stage_duration,
        cache_events,
        model_selection,
        worker_restarts,
        workers_available,
        generated_tokens,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

fn inc_labelled(vec: &CounterVec, labels: &[&str]) {
    if let Ok(c) = vec.get_metric_with_label_values(labels) {
        c.inc();
    }
}

// ── Public helper functions ────────────────────────────────────────────────

/// Record the latency of one decode-pipeline stage.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn record_stage_latency(stage: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.stage_duration.get_metric_with_label_values(&[stage]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Count one finished request (`completion` or `error`).
///
/// # Panics
///
/// This function never panics.
pub fn inc_request(outcome: &str) {
    if let Some(m) = metrics() {
        inc_labelled(&m.requests_total, &[outcome]);
    }
}

/// Count one error of the given taxonomy kind.
///
/// # Panics
///
/// This function never panics.
pub fn inc_error(kind: &str) {
    if let Some(m) = metrics() {
        inc_labelled(&m.errors_total, &[kind]);
    }
}

/// Count a model cache event (`hit`, `miss`, `evict`).
///
/// # Panics
///
/// This function never panics.
pub fn inc_cache_event(event: &str) {
    if let Some(m) = metrics() {
        inc_labelled(&m.cache_events, &[event]);
    }
}

/// Count one routing decision.
///
/// # Panics
///
/// This function never panics.
pub fn inc_model_selection(tier: &str, fallback: bool) {
    if let Some(m) = metrics() {
        let fallback = if fallback { "true" } else { "false" };
        inc_labelled(&m.model_selection, &[tier, fallback]);
    }
}

/// Count one worker respawn.
pub fn inc_worker_restart() {
    if let Some(m) = metrics() {
        m.worker_restarts.inc();
    }
}

/// Set the idle-worker gauge.
pub fn set_workers_available(n: usize) {
    if let Some(m) = metrics() {
        m.workers_available.set(i64::try_from(n).unwrap_or(i64::MAX));
    }
}

/// Add to the generated-token counter.
pub fn add_generated_tokens(n: usize) {
    if let Some(m) = metrics() {
        m.generated_tokens.inc_by(n as u64);
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather() -> String {
    let families = metrics().map_or_else(Vec::new, |m| m.registry.gather());
    if families.is_empty() {
        return String::new();
    }
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// A structured snapshot of the labelled counters.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Request counts keyed by outcome.
    pub requests_total: HashMap<String, u64>,
    /// Error counts keyed by kind.
    pub errors_total: HashMap<String, u64>,
    /// Cache event counts keyed by event.
    pub cache_events: HashMap<String, u64>,
}

fn collect_by_label(vec: &CounterVec, label: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == label)
                .map_or("unknown", |l| l.get_value());
            out.insert(key.to_string(), metric.get_counter().get_value() as u64);
        }
    }
    out
}

/// Return a structured summary of current counter values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    MetricsSummary {
        requests_total: collect_by_label(&m.requests_total, "outcome"),
        errors_total: collect_by_label(&m.errors_total, "kind"),
        cache_events: collect_by_label(&m.cache_events, "event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_never_panic() {
        record_stage_latency("decode", Duration::from_millis(3));
        inc_request("completion");
        inc_error("worker");
        inc_cache_event("hit");
        inc_model_selection("codet5p-33m", false);
        inc_worker_restart();
        set_workers_available(3);
        add_generated_tokens(7);
    }

    #[test]
    fn test_isolated_counter_vec_counts_by_label() {
        let registry = Registry::new();
        let events = CounterVec::new(Opts::new("t_cache_events_total", "test"), &["event"])
            .ok()
            .unwrap();
        registry.register(Box::new(events.clone())).ok().unwrap();
        inc_labelled(&events, &["hit"]);
        inc_labelled(&events, &["hit"]);
        inc_labelled(&events, &["miss"]);

        let by_event = collect_by_label(&events, "event");
        assert_eq!(by_event.get("hit"), Some(&2));
        assert_eq!(by_event.get("miss"), Some(&1));
    }

    #[test]
    fn test_gather_contains_recorded_family() {
        let _ = init_metrics();
        inc_cache_event("evict");
        let text = gather();
        assert!(text.contains("model_cache_events_total"), "got: {text}");
    }

    #[test]
    fn test_summary_reflects_global_counters() {
        let _ = init_metrics();
        inc_error("pool_exhausted");
        let summary = get_metrics_summary();
        assert!(summary.errors_total.get("pool_exhausted").copied().unwrap_or(0) >= 1);
    }
}
