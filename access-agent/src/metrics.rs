//! Prometheus metrics for the ingestion pipeline.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)
//!
//! Counters mirror the monitor's aggregates and are only ever advanced by the monitor task.
//! Queue gauges are refreshed by the status server right before each scrape.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_gauge, HistogramVec, IntCounter,
    IntGauge,
};

lazy_static! {
    // ==================== LATENCY METRICS ====================
    pub static ref SINK_WRITE_DURATION: HistogramVec = register_histogram_vec!(
        "access_agent_sink_write_duration_seconds",
        "Time spent writing a single point to the sink",
        &["status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .unwrap();

    // ==================== COUNTERS ====================
    pub static ref LINES_HANDLED_TOTAL: IntCounter = register_int_counter!(
        "access_agent_lines_handled_total",
        "Lines read from the tailed file"
    )
    .unwrap();
    pub static ref PARSE_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "access_agent_parse_errors_total",
        "Lines dropped because they could not be parsed"
    )
    .unwrap();
    pub static ref WRITE_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "access_agent_write_failures_total",
        "Records dropped after the sink retry budget was exhausted"
    )
    .unwrap();
    pub static ref SINK_WORKER_RESTARTS_TOTAL: IntCounter = register_int_counter!(
        "access_agent_sink_worker_restarts_total",
        "Sink worker restarts performed by the pool supervisor"
    )
    .unwrap();

    // ==================== GAUGES ====================
    pub static ref LINE_QUEUE_LEN: IntGauge = register_int_gauge!(
        "access_agent_line_queue_len",
        "Raw lines waiting for a parser worker"
    )
    .unwrap();
    pub static ref RECORD_QUEUE_LEN: IntGauge = register_int_gauge!(
        "access_agent_record_queue_len",
        "Parsed records waiting for a sink worker"
    )
    .unwrap();
    pub static ref EVENTS_DROPPED: IntGauge = register_int_gauge!(
        "access_agent_events_dropped",
        "Lifecycle events discarded because the monitor queue was full"
    )
    .unwrap();
    pub static ref THROUGHPUT_LINES_PER_SECOND: prometheus::Gauge = prometheus::register_gauge!(
        "access_agent_throughput_lines_per_second",
        "Lines handled per second over the last sample interval"
    )
    .unwrap();
}
