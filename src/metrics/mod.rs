//! Metrics collection for observability

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_with_registry, Counter, CounterVec, Encoder, Histogram, Opts, Registry,
};
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> =
    Lazy::new(|| Arc::new(Metrics::new().expect("Failed to initialize metrics")));

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Escrow metrics
    pub budget_locks: CounterVec,
    pub budget_releases: Counter,
    pub budget_adjustments: CounterVec,
    pub actions_checked: CounterVec,

    // Condensation metrics
    pub condensations: CounterVec,
    pub condensation_skips: CounterVec,
    pub entries_discarded: Histogram,
    pub lessons_added: Counter,
    pub reflector_failures: Counter,
    pub persistence_failures: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let budget_locks = register_counter_vec_with_registry!(
            Opts::new("escrow_budget_locks_total", "Child allocation lock attempts"),
            &["status"],
            registry
        )?;

        let budget_releases = register_counter_with_registry!(
            Opts::new("escrow_budget_releases_total", "Child allocations released"),
            registry
        )?;

        let budget_adjustments = register_counter_vec_with_registry!(
            Opts::new("escrow_budget_adjustments_total", "Child allocation adjustments"),
            &["status"],
            registry
        )?;

        let actions_checked = register_counter_vec_with_registry!(
            Opts::new("escrow_actions_checked_total", "Actions checked by the budget gate"),
            &["decision"],
            registry
        )?;

        let condensations = register_counter_vec_with_registry!(
            Opts::new("condensations_total", "History condensations performed"),
            &["trigger"],
            registry
        )?;

        let condensation_skips = register_counter_vec_with_registry!(
            Opts::new("condensation_skips_total", "Condensations skipped"),
            &["reason"],
            registry
        )?;

        let entries_discarded = register_histogram_with_registry!(
            "condensation_entries_discarded",
            "History entries discarded per condensation",
            registry
        )?;

        let lessons_added = register_counter_with_registry!(
            Opts::new("condensation_lessons_added_total", "Lessons added by reflection"),
            registry
        )?;

        let reflector_failures = register_counter_with_registry!(
            Opts::new("condensation_reflector_failures_total", "Failed reflection calls"),
            registry
        )?;

        let persistence_failures = register_counter_with_registry!(
            Opts::new("condensation_persistence_failures_total", "Failed state writes"),
            registry
        )?;

        Ok(Self {
            registry,
            budget_locks,
            budget_releases,
            budget_adjustments,
            actions_checked,
            condensations,
            condensation_skips,
            entries_discarded,
            lessons_added,
            reflector_failures,
            persistence_failures,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_lock(&self, success: bool) {
        let status = if success { "success" } else { "rejected" };
        self.budget_locks.with_label_values(&[status]).inc();
    }

    pub fn record_adjustment(&self, success: bool) {
        let status = if success { "success" } else { "rejected" };
        self.budget_adjustments.with_label_values(&[status]).inc();
    }

    pub fn record_action(&self, allowed: bool) {
        let decision = if allowed { "allowed" } else { "blocked" };
        self.actions_checked.with_label_values(&[decision]).inc();
    }

    pub fn record_condensation(&self, trigger: &str, discarded: usize, lessons_added: usize) {
        self.condensations.with_label_values(&[trigger]).inc();
        self.entries_discarded.observe(discarded as f64);
        self.lessons_added.inc_by(lessons_added as f64);
    }

    pub fn record_skip(&self, reason: &str) {
        self.condensation_skips.with_label_values(&[reason]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}
