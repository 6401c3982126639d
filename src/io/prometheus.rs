//! Prometheus text exposition for engine metrics
//!
//! Served at `GET /metrics` by the HTTP API. Reads a non-resetting
//! snapshot so scrapes never disturb the periodic log reporter.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_update_metrics(&mut output, site_id, &summary);
    write_alert_metrics(&mut output, site_id, &summary);
    write_session_metrics(&mut output, site_id, &summary);
    write_optimizer_metrics(&mut output, site_id, &summary);

    output
}

fn write_update_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "trailguard_updates_total",
        "Location updates processed",
        MetricType::Counter,
        site,
        summary.updates_total,
    );
    write_metric(
        output,
        "trailguard_updates_rejected_total",
        "Location updates rejected by validation",
        MetricType::Counter,
        site,
        summary.updates_rejected,
    );
    write_metric(
        output,
        "trailguard_duplicates_skipped_total",
        "Location updates identical to the previous report",
        MetricType::Counter,
        site,
        summary.duplicates_skipped,
    );
    write_histogram(
        output,
        "trailguard_update_latency_us",
        "Location update processing latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.avg_latency_us,
    );
}

fn write_alert_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP trailguard_alerts_total Alerts emitted by kind");
    let _ = writeln!(output, "# TYPE trailguard_alerts_total counter");
    for (kind, val) in [
        ("enter", summary.alerts_enter),
        ("exit", summary.alerts_exit),
        ("sos", summary.alerts_sos),
    ] {
        let _ = writeln!(output, "trailguard_alerts_total{{site=\"{site}\",kind=\"{kind}\"}} {val}");
    }

    write_metric(
        output,
        "trailguard_enters_deduplicated_total",
        "Repeated ENTER alerts suppressed",
        MetricType::Counter,
        site,
        summary.enters_deduplicated,
    );
    write_metric(
        output,
        "trailguard_deliveries_dropped_total",
        "Messages dropped due to closed or full client queues",
        MetricType::Counter,
        site,
        summary.deliveries_dropped,
    );
    write_metric(
        output,
        "trailguard_audit_dropped_total",
        "Audit records dropped due to channel full",
        MetricType::Counter,
        site,
        summary.audit_dropped,
    );
}

fn write_session_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "trailguard_sessions_active",
        "Active tourist sessions",
        MetricType::Gauge,
        site,
        summary.sessions_active,
    );
    write_metric(
        output,
        "trailguard_sessions_expired_total",
        "Sessions removed by the TTL sweeper",
        MetricType::Counter,
        site,
        summary.sessions_expired,
    );
    write_metric(
        output,
        "trailguard_zones_active",
        "Hazard zones in the active snapshot",
        MetricType::Gauge,
        site,
        summary.zones_active,
    );

    let _ = writeln!(output, "# HELP trailguard_zone_refresh_total Zone refresh attempts by outcome");
    let _ = writeln!(output, "# TYPE trailguard_zone_refresh_total counter");
    let _ = writeln!(
        output,
        "trailguard_zone_refresh_total{{site=\"{site}\",outcome=\"ok\"}} {}",
        summary.zone_refresh_ok
    );
    let _ = writeln!(
        output,
        "trailguard_zone_refresh_total{{site=\"{site}\",outcome=\"failed\"}} {}",
        summary.zone_refresh_failed
    );
}

fn write_optimizer_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "trailguard_optimizations_total",
        "Route optimizations completed",
        MetricType::Counter,
        site,
        summary.optimizations_total,
    );
    write_metric(
        output,
        "trailguard_optimizations_timed_out_total",
        "Route optimizations that returned best-so-far at the deadline",
        MetricType::Counter,
        site,
        summary.optimizations_timed_out,
    );
    write_metric(
        output,
        "trailguard_optimizations_rejected_total",
        "Route optimization requests rejected by validation",
        MetricType::Counter,
        site,
        summary.optimizations_rejected,
    );
    write_histogram(
        output,
        "trailguard_optimizer_time_ms",
        "Route optimization wall time in milliseconds",
        site,
        &summary.optimizer_time_buckets,
        summary.optimizer_time_avg_ms,
    );
    write_metric(
        output,
        "trailguard_distance_saved_meters_total",
        "Travel distance saved by optimization",
        MetricType::Counter,
        site,
        summary.distance_saved_total_m,
    );
}
