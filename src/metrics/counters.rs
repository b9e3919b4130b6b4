//! Counter metrics

/// A connect (or bind) attempt was handed to the engine
pub fn connect_attempted(role: &'static str) {
    metrics::counter!("wire_connect_attempts_total", "role" => role).increment(1);
}

/// A connect attempt reached its single outcome
pub fn connect_completed(role: &'static str, result: &'static str) {
    metrics::counter!(
        "wire_connect_outcomes_total",
        "role" => role,
        "result" => result
    )
    .increment(1);
}

/// A connect attempt failed, by error class
pub fn connect_failed(role: &'static str, error: &'static str) {
    metrics::counter!(
        "wire_connect_failures_total",
        "role" => role,
        "error" => error
    )
    .increment(1);
}

/// The engine reported "established" more than once for one attempt
pub fn duplicate_established(role: &'static str) {
    metrics::counter!("wire_connect_duplicate_established_total", "role" => role).increment(1);
}

/// A live connection was torn down
pub fn connection_disposed(teardown: &'static str) {
    metrics::counter!("wire_connect_disposals_total", "teardown" => teardown).increment(1);
}

/// A listener accepted a child connection
pub fn child_accepted() {
    metrics::counter!("wire_connect_children_accepted_total").increment(1);
}

/// An error surfaced on a listener with no child connection to blame
pub fn listener_error(error: &'static str) {
    metrics::counter!("wire_connect_listener_errors_total", "error" => error).increment(1);
}
