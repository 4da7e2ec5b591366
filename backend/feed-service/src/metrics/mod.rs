//! Prometheus metrics for the fan-out engine and the feed read path

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec,
    IntGaugeVec, TextEncoder,
};
use std::time::Duration;

use crate::models::QueueStats;

static FANOUT_JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fanout_jobs_total",
        "Fan-out job outcomes (completed/rescheduled/failed/released/lease_lost)",
        &["outcome"]
    )
    .expect("Failed to register fanout jobs metric")
});

static FANOUT_JOB_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fanout_job_duration_seconds",
        "Duration of one fan-out job attempt",
        &["strategy"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    )
    .expect("Failed to register fanout job duration metric")
});

static FANOUT_ROWS_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fanout_timeline_rows_written_total",
        "Timeline rows newly written by push fan-out"
    )
    .expect("Failed to register fanout rows metric")
});

static FANOUT_BATCH_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fanout_batch_retries_total",
        "Timeline sub-batch write retries"
    )
    .expect("Failed to register fanout batch retry metric")
});

static FANOUT_QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "fanout_queue_jobs",
        "Fan-out jobs per status at last stats read",
        &["status"]
    )
    .expect("Failed to register fanout queue depth metric")
});

static FANOUT_CLEANUP_DELETED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fanout_cleanup_deleted_total",
        "Completed fan-out jobs removed by cleanup"
    )
    .expect("Failed to register fanout cleanup metric")
});

static FEED_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_requests_total",
        "Feed requests served, by source (hybrid/cache)",
        &["source"]
    )
    .expect("Failed to register feed requests metric")
});

static FEED_DEGRADED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_degraded_reads_total",
        "Feed read-path fetches that failed and were omitted",
        &["stage"]
    )
    .expect("Failed to register feed degraded metric")
});

static FEED_REQUEST_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "feed_request_duration_seconds",
        "Latency of GetUserFeed",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
    )
    .expect("Failed to register feed latency metric")
});

static CACHE_UPDATES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_cache_updates_total",
        "Asynchronous cache updates (applied/failed/dropped)",
        &["result"]
    )
    .expect("Failed to register cache updates metric")
});

pub fn record_job_outcome(outcome: &str) {
    FANOUT_JOBS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_job_duration(strategy: &str, duration: Duration) {
    FANOUT_JOB_DURATION_SECONDS
        .with_label_values(&[strategy])
        .observe(duration.as_secs_f64());
}

pub fn record_rows_written(count: u64) {
    FANOUT_ROWS_WRITTEN_TOTAL.inc_by(count);
}

pub fn record_batch_retry() {
    FANOUT_BATCH_RETRIES_TOTAL.inc();
}

pub fn set_queue_depth(stats: &QueueStats) {
    FANOUT_QUEUE_DEPTH
        .with_label_values(&["pending"])
        .set(stats.pending);
    FANOUT_QUEUE_DEPTH
        .with_label_values(&["processing"])
        .set(stats.processing);
    FANOUT_QUEUE_DEPTH
        .with_label_values(&["completed"])
        .set(stats.completed);
    FANOUT_QUEUE_DEPTH
        .with_label_values(&["failed"])
        .set(stats.failed);
}

pub fn record_cleanup_deleted(count: u64) {
    FANOUT_CLEANUP_DELETED_TOTAL.inc_by(count);
}

pub fn record_feed_request(source: &str, duration: Duration) {
    FEED_REQUESTS_TOTAL.with_label_values(&[source]).inc();
    FEED_REQUEST_DURATION_SECONDS.observe(duration.as_secs_f64());
}

/// A read-path fetch failed and its items were left out (following/celebrity/fallback)
pub fn record_degraded_read(stage: &str) {
    FEED_DEGRADED_TOTAL.with_label_values(&[stage]).inc();
}

pub fn record_cache_update(result: &str) {
    CACHE_UPDATES_TOTAL.with_label_values(&[result]).inc();
}

/// `GET /metrics`
pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
