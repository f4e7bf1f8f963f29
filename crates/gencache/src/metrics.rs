use prometheus::{Encoder, TextEncoder, Registry, IntCounterVec, Histogram, HistogramOpts};
use lazy_static::lazy_static;
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static LOOKUPS: OnceLock<IntCounterVec> = OnceLock::new();
static ADVISORY_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();
static MIGRATIONS: OnceLock<IntCounterVec> = OnceLock::new();
static LOOKUP_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Register the process collectors. Safe to call more than once.
pub fn init_metrics() -> prometheus::Result<()> {
    if LOOKUPS.get().is_some() {
        return Ok(());
    }

    let lookups = IntCounterVec::new(
        prometheus::opts!("gencache_lookups_total", "Cache lookups by kind and serving tier"),
        &["kind", "tier"],
    )?;
    let advisory_failures = IntCounterVec::new(
        prometheus::opts!("gencache_advisory_failures_total", "Volatile-tier operations that failed and were absorbed"),
        &["op"],
    )?;
    let migrations = IntCounterVec::new(
        prometheus::opts!("gencache_migrations_total", "Migrations by type and final status"),
        &["type", "status"],
    )?;
    let lookup_latency = Histogram::with_opts(
        HistogramOpts::new("gencache_lookup_latency_seconds", "Lookup latency across both tiers")
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
    )?;

    REGISTRY.register(Box::new(lookups.clone())).ok();
    REGISTRY.register(Box::new(advisory_failures.clone())).ok();
    REGISTRY.register(Box::new(migrations.clone())).ok();
    REGISTRY.register(Box::new(lookup_latency.clone())).ok();

    let _ = LOOKUPS.set(lookups);
    let _ = ADVISORY_FAILURES.set(advisory_failures);
    let _ = MIGRATIONS.set(migrations);
    let _ = LOOKUP_LATENCY.set(lookup_latency);
    Ok(())
}

pub fn inc_lookup(kind: &str, tier: &str) {
    if let Some(counter) = LOOKUPS.get() {
        counter.with_label_values(&[kind, tier]).inc();
    }
}

pub fn inc_advisory_failure(op: &str) {
    if let Some(counter) = ADVISORY_FAILURES.get() {
        counter.with_label_values(&[op]).inc();
    }
}

pub fn inc_migration(migration_type: &str, status: &str) {
    if let Some(counter) = MIGRATIONS.get() {
        counter.with_label_values(&[migration_type, status]).inc();
    }
}

pub fn observe_lookup_latency(seconds: f64) {
    if let Some(histogram) = LOOKUP_LATENCY.get() {
        histogram.observe(seconds);
    }
}

/// Text exposition of everything registered.
pub fn gather_text() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
