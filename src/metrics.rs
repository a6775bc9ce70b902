use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref ACTIVE_STREAMS: IntGauge = register_int_gauge!(
        "tvgate_active_streams",
        "Number of occupied stream slots"
    )
    .unwrap();
    pub static ref STREAM_STARTS: IntCounterVec = register_int_counter_vec!(
        "tvgate_stream_starts_total",
        "Stream sessions started, by kind",
        &["kind"]
    )
    .unwrap();
}

pub fn set_active_streams(count: i64) {
    ACTIVE_STREAMS.set(count);
}

pub fn record_stream_start(kind: &str) {
    STREAM_STARTS.with_label_values(&[kind]).inc();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
