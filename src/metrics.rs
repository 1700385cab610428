use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntCounterVec, IntGaugeVec, register_histogram, register_int_counter,
    register_int_counter_vec, register_int_gauge_vec,
};


lazy_static! {
    pub static ref ADMITTED_TOTAL: IntCounter =
        register_int_counter!("admission_requests_total", "Total number of admitted requests").unwrap();
    pub static ref REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "admission_rejections_total",
        "Total number of rejected requests by reason",
        &["reason"]
    )
    .unwrap();
    // one series per filter, labelled with AdmissionFilter::id
    pub static ref TRACKED_CLIENTS: IntGaugeVec = register_int_gauge_vec!(
        "admission_tracked_clients",
        "Current number of tracked client addresses",
        &["filter"]
    )
    .unwrap();
    pub static ref EVICTED_TOTAL: IntCounter =
        register_int_counter!("admission_evictions_total", "Total idle clients evicted").unwrap();
    pub static ref UPSTREAM_LATENCY: Histogram = register_histogram!(
        "admission_upstream_latency_seconds",
        "Upstream request latency in seconds"
    )
    .unwrap();
}
