//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `banker_accounts` - Number of accounts in the master tree
//! - `banker_accounts_created_total` - Total accounts created
//! - `banker_syncs_total` - Total shadow deltas applied
//! - `banker_stale_syncs_total` - Total out-of-order syncs rejected
//! - `banker_sync_apply_duration_seconds` - Histogram of delta apply latencies
//! - `banker_invariant_violations_total` - Total invariant violations observed
//! - `banker_snapshots_total` - Total snapshots written

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
///
/// Everything registers into the collector's own registry, so several
/// bankers can coexist in one process.
#[derive(Clone)]
pub struct Metrics {
    /// Number of accounts in the master tree
    pub accounts: IntGauge,

    /// Total accounts created
    pub accounts_created: IntCounter,

    /// Total shadow deltas applied
    pub syncs_total: IntCounter,

    /// Total out-of-order syncs rejected
    pub stale_syncs_total: IntCounter,

    /// Delta apply duration histogram
    pub sync_apply_duration: Histogram,

    /// Total invariant violations observed
    pub invariant_violations: IntCounter,

    /// Total snapshots written
    pub snapshots_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let accounts = IntGauge::with_opts(Opts::new(
            "banker_accounts",
            "Number of accounts in the master tree",
        ))?;
        registry.register(Box::new(accounts.clone()))?;

        let accounts_created = IntCounter::with_opts(Opts::new(
            "banker_accounts_created_total",
            "Total accounts created",
        ))?;
        registry.register(Box::new(accounts_created.clone()))?;

        let syncs_total = IntCounter::with_opts(Opts::new(
            "banker_syncs_total",
            "Total shadow deltas applied",
        ))?;
        registry.register(Box::new(syncs_total.clone()))?;

        let stale_syncs_total = IntCounter::with_opts(Opts::new(
            "banker_stale_syncs_total",
            "Total out-of-order syncs rejected",
        ))?;
        registry.register(Box::new(stale_syncs_total.clone()))?;

        let sync_apply_duration = Histogram::with_opts(
            HistogramOpts::new(
                "banker_sync_apply_duration_seconds",
                "Histogram of delta apply latencies",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100]),
        )?;
        registry.register(Box::new(sync_apply_duration.clone()))?;

        let invariant_violations = IntCounter::with_opts(Opts::new(
            "banker_invariant_violations_total",
            "Total invariant violations observed",
        ))?;
        registry.register(Box::new(invariant_violations.clone()))?;

        let snapshots_total = IntCounter::with_opts(Opts::new(
            "banker_snapshots_total",
            "Total snapshots written",
        ))?;
        registry.register(Box::new(snapshots_total.clone()))?;

        Ok(Self {
            accounts,
            accounts_created,
            syncs_total,
            stale_syncs_total,
            sync_apply_duration,
            invariant_violations,
            snapshots_total,
            registry,
        })
    }

    /// Record account creation
    pub fn record_account_created(&self) {
        self.accounts_created.inc();
    }

    /// Update the account count gauge
    pub fn update_account_count(&self, count: i64) {
        self.accounts.set(count);
    }

    /// Record an applied shadow delta
    pub fn record_sync(&self, duration_seconds: f64) {
        self.syncs_total.inc();
        self.sync_apply_duration.observe(duration_seconds);
    }

    /// Record a rejected out-of-order sync
    pub fn record_stale_sync(&self) {
        self.stale_syncs_total.inc();
    }

    /// Record an invariant violation
    pub fn record_invariant_violation(&self) {
        self.invariant_violations.inc();
    }

    /// Record a snapshot write
    pub fn record_snapshot(&self) {
        self.snapshots_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.syncs_total.get(), 0);
        assert_eq!(metrics.accounts.get(), 0);

        // A second collector registers into its own registry
        let other = Metrics::new().unwrap();
        assert_eq!(other.syncs_total.get(), 0);
    }

    #[test]
    fn test_record_sync() {
        let metrics = Metrics::new().unwrap();
        metrics.record_sync(0.002);
        metrics.record_sync(0.004);
        assert_eq!(metrics.syncs_total.get(), 2);
    }

    #[test]
    fn test_record_stale_sync() {
        let metrics = Metrics::new().unwrap();
        metrics.record_stale_sync();
        assert_eq!(metrics.stale_syncs_total.get(), 1);
    }

    #[test]
    fn test_update_account_count() {
        let metrics = Metrics::new().unwrap();
        metrics.update_account_count(5);
        assert_eq!(metrics.accounts.get(), 5);
    }
}
