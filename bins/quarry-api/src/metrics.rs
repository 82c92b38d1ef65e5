// Prometheus metrics for the request pipeline

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, Encoder, Histogram, IntCounterVec, TextEncoder,
};
use quarry_engine::orchestrator::{PhaseStats, PipelineStatus};
use quarry_engine::Processed;
use quarry_common::types::Phase;

lazy_static! {
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quarry_requests_total",
        "Requests by response source",
        &["outcome"]
    )
    .expect("quarry_requests_total can be registered");
    pub static ref SYNTHESIS_CALLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quarry_synthesis_calls_total",
        "LLM synthesis calls per phase",
        &["phase"]
    )
    .expect("quarry_synthesis_calls_total can be registered");
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quarry_executions_total",
        "Sandbox executions per phase",
        &["phase"]
    )
    .expect("quarry_executions_total can be registered");
    pub static ref RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quarry_retries_total",
        "Retries per phase and kind (logged or structural)",
        &["phase", "kind"]
    )
    .expect("quarry_retries_total can be registered");
    pub static ref ABORTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quarry_aborts_total",
        "Pipeline aborts per phase and reason",
        &["phase", "reason"]
    )
    .expect("quarry_aborts_total can be registered");
    pub static ref REQUEST_DURATION: Histogram = register_histogram!(
        "quarry_request_duration_seconds",
        "End-to-end request processing time",
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .expect("quarry_request_duration_seconds can be registered");
}

/// Touch every metric so they show up before the first request
pub fn register() {
    lazy_static::initialize(&REQUESTS_TOTAL);
    lazy_static::initialize(&SYNTHESIS_CALLS_TOTAL);
    lazy_static::initialize(&EXECUTIONS_TOTAL);
    lazy_static::initialize(&RETRIES_TOTAL);
    lazy_static::initialize(&ABORTS_TOTAL);
    lazy_static::initialize(&REQUEST_DURATION);
}

pub fn record(processed: &Processed) {
    REQUESTS_TOTAL
        .with_label_values(&[processed.response.source.label()])
        .inc();
    REQUEST_DURATION.observe(processed.elapsed_ms as f64 / 1000.0);

    let Some(report) = &processed.report else {
        return;
    };

    record_phase(Phase::Acquisition, &report.acquisition);
    record_phase(Phase::Answer, &report.answer);

    if let PipelineStatus::Aborted { phase, reason } = &report.status {
        ABORTS_TOTAL
            .with_label_values(&[phase.as_str(), reason.label()])
            .inc();
    }
}

fn record_phase(phase: Phase, stats: &PhaseStats) {
    let phase = phase.as_str();
    SYNTHESIS_CALLS_TOTAL
        .with_label_values(&[phase])
        .inc_by(stats.synthesis_calls as u64);
    EXECUTIONS_TOTAL
        .with_label_values(&[phase])
        .inc_by(stats.executions as u64);
    RETRIES_TOTAL
        .with_label_values(&[phase, "logged"])
        .inc_by(stats.logged_failures as u64);
    RETRIES_TOTAL
        .with_label_values(&[phase, "structural"])
        .inc_by(stats.structural_retries as u64);
}

/// Render the default registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
