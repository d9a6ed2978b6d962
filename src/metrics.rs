//! Metrics surface (spec §6): counters and gauges namespaced per component,
//! scraped by an external Prometheus-compatible collector. No dashboards
//! prescribed here — this module only registers and updates the series.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter_vec, register_int_gauge_vec,
    CounterVec, GaugeVec, IntCounterVec, IntGaugeVec,
};

pub static REQUESTS_ISSUED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingest_rest_requests_issued_total",
        "REST requests issued per exchange/endpoint",
        &["exchange", "endpoint"]
    )
    .unwrap()
});

pub static REQUESTS_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingest_rest_requests_failed_total",
        "REST requests failed per exchange/endpoint/class",
        &["exchange", "endpoint", "class"]
    )
    .unwrap()
});

pub static WS_MESSAGES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingest_ws_messages_received_total",
        "WebSocket messages received per exchange/stream",
        &["exchange", "stream"]
    )
    .unwrap()
});

pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ingest_queue_depth",
        "Current depth of the bounded in-memory queue per topic",
        &["topic"]
    )
    .unwrap()
});

pub static QUEUE_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingest_queue_dropped_total",
        "Messages dropped from a bounded queue on overflow",
        &["topic"]
    )
    .unwrap()
});

pub static FLUSHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingest_writer_flushes_total",
        "Writer flush count per topic",
        &["topic"]
    )
    .unwrap()
});

pub static ROWS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingest_writer_rows_written_total",
        "Rows persisted per topic",
        &["topic"]
    )
    .unwrap()
});

pub static DEAD_LETTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingest_writer_dead_letter_total",
        "Batches moved to the dead-letter collection per topic",
        &["topic"]
    )
    .unwrap()
});

pub static TASKS_BY_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ingest_backfill_tasks",
        "Backfill tasks by status",
        &["status"]
    )
    .unwrap()
});

pub static QUALITY_SCORE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "ingest_quality_score",
        "Latest quality score per market/timeframe",
        &["market", "timeframe"]
    )
    .unwrap()
});

pub static RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingest_ws_reconnects_total",
        "WebSocket reconnect count per exchange",
        &["exchange"]
    )
    .unwrap()
});

pub static SESSION_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ingest_ws_session_state",
        "Current session state per exchange (enum ordinal)",
        &["exchange"]
    )
    .unwrap()
});

pub static RATE_LIMIT_WAIT_SECONDS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ingest_rate_limit_wait_seconds_total",
        "Cumulative seconds spent waiting for a rate-limit permit",
        &["exchange"]
    )
    .unwrap()
});

/// Force registration of every series at startup so `/metrics` always
/// reports a complete (if zeroed) set instead of only what has fired.
pub fn init() {
    Lazy::force(&REQUESTS_ISSUED);
    Lazy::force(&REQUESTS_FAILED);
    Lazy::force(&WS_MESSAGES_RECEIVED);
    Lazy::force(&QUEUE_DEPTH);
    Lazy::force(&QUEUE_DROPPED);
    Lazy::force(&FLUSHES);
    Lazy::force(&ROWS_WRITTEN);
    Lazy::force(&DEAD_LETTER);
    Lazy::force(&TASKS_BY_STATE);
    Lazy::force(&QUALITY_SCORE);
    Lazy::force(&RECONNECTS);
    Lazy::force(&SESSION_STATE);
    Lazy::force(&RATE_LIMIT_WAIT_SECONDS);
}
