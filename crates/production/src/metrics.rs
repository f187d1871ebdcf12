//! Production metrics using native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters.
//! Use traces for event-level granularity during investigations.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for production monitoring.
pub struct Metrics {
    // === Consensus ===
    pub proposals_committed: Counter,
    pub proposal_apply_latency: Histogram,
    pub committed_index: Gauge,
    pub stable_checkpoint: Gauge,
    pub view: Gauge,
    pub view_changes: Counter,
    pub consensus_timeout_seconds: Gauge,

    // === Faults ===
    pub equivocations_detected: Counter,
    pub apply_failures: Counter,
    pub apply_failure_alerts: Counter,
    pub consecutive_apply_failures: Gauge,

    // === Infrastructure ===
    pub network_messages_sent: CounterVec,
    pub network_messages_received: CounterVec,
    pub signature_verification_latency: Histogram,

    // === Thread Pools ===
    pub crypto_pool_queue_depth: Gauge,
    pub apply_pool_queue_depth: Gauge,

    // === Storage ===
    pub storage_write_latency: Histogram,

    // === Errors ===
    pub signature_verification_failures: Counter,
    pub messages_rejected: CounterVec,
    pub messages_stale: Counter,
    pub decode_failures: Counter,
}

impl Metrics {
    fn new() -> Self {
        // Latency buckets: 1ms to 60s
        let latency_buckets = vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ];

        Self {
            // Consensus
            proposals_committed: register_counter!(
                "pbft_proposals_committed_total",
                "Total number of proposals committed and applied"
            )
            .unwrap(),

            proposal_apply_latency: register_histogram!(
                "pbft_proposal_apply_latency_seconds",
                "Time spent by the executor applying a committed proposal",
                latency_buckets.clone()
            )
            .unwrap(),

            committed_index: register_gauge!("pbft_committed_index", "Highest applied index")
                .unwrap(),

            stable_checkpoint: register_gauge!(
                "pbft_stable_checkpoint",
                "Highest index with a stable checkpoint"
            )
            .unwrap(),

            view: register_gauge!("pbft_view", "Current view").unwrap(),

            view_changes: register_counter!(
                "pbft_view_changes_total",
                "Total number of views adopted after start-up"
            )
            .unwrap(),

            consensus_timeout_seconds: register_gauge!(
                "pbft_consensus_timeout_seconds",
                "Current consensus timeout including backoff"
            )
            .unwrap(),

            // Faults
            equivocations_detected: register_counter!(
                "pbft_equivocations_detected_total",
                "Conflicting votes or proposals observed from the same sealer"
            )
            .unwrap(),

            apply_failures: register_counter!(
                "pbft_apply_failures_total",
                "Failed attempts to apply a committed proposal"
            )
            .unwrap(),

            apply_failure_alerts: register_counter!(
                "pbft_apply_failure_alerts_total",
                "Times consecutive apply failures crossed the alert threshold"
            )
            .unwrap(),

            consecutive_apply_failures: register_gauge!(
                "pbft_consecutive_apply_failures",
                "Failed attempts to apply the next index since the last success"
            )
            .unwrap(),

            // Infrastructure
            network_messages_sent: register_counter_vec!(
                "pbft_network_messages_sent_total",
                "Total network messages sent",
                &["type"]
            )
            .unwrap(),

            network_messages_received: register_counter_vec!(
                "pbft_network_messages_received_total",
                "Total network messages received",
                &["type"]
            )
            .unwrap(),

            signature_verification_latency: register_histogram!(
                "pbft_signature_verification_latency_seconds",
                "Signature verification latency",
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]
            )
            .unwrap(),

            // Thread Pools
            crypto_pool_queue_depth: register_gauge!(
                "pbft_crypto_pool_queue_depth",
                "Number of pending tasks in crypto verification pool"
            )
            .unwrap(),

            apply_pool_queue_depth: register_gauge!(
                "pbft_apply_pool_queue_depth",
                "Number of pending tasks in apply pool"
            )
            .unwrap(),

            // Storage
            storage_write_latency: register_histogram!(
                "pbft_storage_write_latency_seconds",
                "Consensus state persistence latency",
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]
            )
            .unwrap(),

            // Errors
            signature_verification_failures: register_counter!(
                "pbft_signature_verification_failures_total",
                "Total signature verification failures"
            )
            .unwrap(),

            messages_rejected: register_counter_vec!(
                "pbft_messages_rejected_total",
                "Messages refused by admission checks",
                &["reason"]
            )
            .unwrap(),

            messages_stale: register_counter!(
                "pbft_messages_stale_total",
                "Messages dropped because their view or index is already behind us"
            )
            .unwrap(),

            decode_failures: register_counter!(
                "pbft_decode_failures_total",
                "Inbound frames that could not be decoded"
            )
            .unwrap(),
        }
    }
}

/// Get or initialize the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Record a proposal applied at `index`.
pub fn record_proposal_committed(index: u64) {
    let m = metrics();
    m.proposals_committed.inc();
    m.committed_index.set(index as f64);
}

pub fn record_apply_latency(latency_secs: f64) {
    metrics().proposal_apply_latency.observe(latency_secs);
}

/// Update gauges that mirror the state machine snapshot.
pub fn set_consensus_progress(
    view: u64,
    stable_checkpoint: u64,
    timeout_secs: f64,
    consecutive_apply_failures: u32,
) {
    let m = metrics();
    m.view.set(view as f64);
    m.stable_checkpoint.set(stable_checkpoint as f64);
    m.consensus_timeout_seconds.set(timeout_secs);
    m.consecutive_apply_failures
        .set(consecutive_apply_failures as f64);
}

pub fn record_view_changes(count: u64) {
    metrics().view_changes.inc_by(count as f64);
}

pub fn record_equivocation() {
    metrics().equivocations_detected.inc();
}

pub fn record_apply_failures(count: u64) {
    metrics().apply_failures.inc_by(count as f64);
}

pub fn record_apply_failure_alert() {
    metrics().apply_failure_alerts.inc();
}

/// Update thread pool queue depths.
pub fn set_pool_queue_depths(crypto: usize, apply: usize) {
    let m = metrics();
    m.crypto_pool_queue_depth.set(crypto as f64);
    m.apply_pool_queue_depth.set(apply as f64);
}

pub fn record_storage_write(latency_secs: f64) {
    metrics().storage_write_latency.observe(latency_secs);
}

pub fn record_signature_verification_failure() {
    metrics().signature_verification_failures.inc();
}

/// Record rejected messages.
///
/// **Cardinality control**: `reason` must come from `RejectReason::as_str`.
/// Do NOT use dynamic strings (e.g., error messages) as reasons.
pub fn record_messages_rejected(reason: &str, count: u64) {
    metrics()
        .messages_rejected
        .with_label_values(&[reason])
        .inc_by(count as f64);
}

/// Add stale drops observed since the last call.
pub fn record_messages_stale(count: u64) {
    metrics().messages_stale.inc_by(count as f64);
}

pub fn record_decode_failure() {
    metrics().decode_failures.inc();
}

/// Record network message sent. `msg_type` comes from `PbftMessage::type_name`.
pub fn record_network_message_sent(msg_type: &str) {
    metrics()
        .network_messages_sent
        .with_label_values(&[msg_type])
        .inc();
}

/// Record network message received. `msg_type` comes from `PbftMessage::type_name`.
pub fn record_network_message_received(msg_type: &str) {
    metrics()
        .network_messages_received
        .with_label_values(&[msg_type])
        .inc();
}

pub fn record_signature_verification_latency(latency_secs: f64) {
    metrics()
        .signature_verification_latency
        .observe(latency_secs);
}
