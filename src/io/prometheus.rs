//! Prometheus text exposition of coordinator metrics
//!
//! Served at GET /metrics by the RPC server.

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
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a counter split by outcome label
fn write_outcome_counter(output: &mut String, name: &str, help: &str, site: &str, ok: u64, failed: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name}{{site=\"{site}\",outcome=\"ok\"}} {ok}");
    let _ = writeln!(output, "{name}{{site=\"{site}\",outcome=\"failed\"}} {failed}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
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
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_registry_metrics(&mut output, site_id, &summary);
    write_broadcast_metrics(&mut output, site_id, &summary);
    write_barrier_metrics(&mut output, site_id, &summary);
    write_schedule_metrics(&mut output, site_id, &summary);

    output
}

fn write_registry_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "crossing_registrations_total",
        "RegisterClient calls accepted",
        MetricType::Counter,
        site,
        summary.registrations_total,
    );
    write_outcome_counter(
        output,
        "crossing_logins_total",
        "Dashboard login attempts",
        site,
        summary.logins_ok,
        summary.logins_failed,
    );
}

fn write_broadcast_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "crossing_broadcasts_total",
        "Status broadcasts processed",
        MetricType::Counter,
        site,
        summary.broadcasts_total,
    );
    write_outcome_counter(
        output,
        "crossing_device_calls_total",
        "Outbound UpdateLightStatus calls",
        site,
        summary.device_calls_ok,
        summary.device_calls_failed,
    );
    write_histogram(
        output,
        "crossing_device_call_latency_us",
        "Outbound device call latency in microseconds",
        site,
        &summary.device_latency_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.device_latency_avg_us,
    );
    write_metric(
        output,
        "crossing_device_call_latency_p99_us",
        "99th percentile device call latency",
        MetricType::Gauge,
        site,
        summary.device_latency_p99_us,
    );
    write_metric(
        output,
        "crossing_device_call_latency_max_us",
        "Maximum device call latency",
        MetricType::Gauge,
        site,
        summary.device_latency_max_us,
    );
    write_metric(
        output,
        "crossing_egress_dropped_total",
        "MQTT egress messages dropped due to channel full",
        MetricType::Counter,
        site,
        summary.egress_dropped,
    );
}

fn write_barrier_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_outcome_counter(
        output,
        "crossing_barrier_commands_total",
        "Barrier commands issued by the interlock",
        site,
        summary.barrier_commands_ok,
        summary.barrier_commands_failed,
    );
    write_metric(
        output,
        "crossing_sensor_noops_total",
        "Sensor signals that needed no barrier command",
        MetricType::Counter,
        site,
        summary.sensor_noops_total,
    );
    write_metric(
        output,
        "crossing_barrier_state",
        "Current barrier state (0=up, 1=down)",
        MetricType::Gauge,
        site,
        summary.barrier_state,
    );
}

fn write_schedule_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "crossing_schedule_firings_total",
        "Crossing schedule firings",
        MetricType::Counter,
        site,
        summary.schedule_firings_total,
    );
}
