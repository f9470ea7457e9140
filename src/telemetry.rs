//! Metrics collection for the loop controller.
//!
//! Uses the `metrics` facade - no exporters included.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Initialize metric descriptions.
///
/// Call once at startup to register metric metadata.
pub fn init_metrics() {
    describe_counter!("loop_clients_connected_total", "Client connections accepted");
    describe_counter!("loop_games_ingested_total", "Self-play games recorded");
    describe_counter!(
        "loop_positions_ingested_total",
        "Augmented positions committed to the self-play database"
    );
    describe_counter!(
        "loop_positions_discarded_total",
        "Augmented positions dropped by the per-generation row budget"
    );
    describe_counter!("loop_training_steps_total", "Completed train steps");
    describe_counter!("loop_matches_recorded_total", "Rating match records inserted");

    describe_gauge!("loop_active_connections", "Currently registered client connections");
    describe_gauge!("loop_latest_generation", "Latest committed model generation");
}

pub fn record_client_connected(role: &str) {
    counter!("loop_clients_connected_total", "role" => role.to_string()).increment(1);
}

pub fn record_active_connections(count: usize) {
    gauge!("loop_active_connections").set(count as f64);
}

pub fn record_games_ingested(games: u64, positions: u64) {
    counter!("loop_games_ingested_total").increment(games);
    counter!("loop_positions_ingested_total").increment(positions);
}

pub fn record_positions_discarded(positions: u64) {
    counter!("loop_positions_discarded_total").increment(positions);
}

pub fn record_training_step(gen: u32) {
    counter!("loop_training_steps_total").increment(1);
    gauge!("loop_latest_generation").set(f64::from(gen));
}

pub fn record_match_recorded() {
    counter!("loop_matches_recorded_total").increment(1);
}
