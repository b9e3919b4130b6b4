//! Histogram metrics

/// Time from handing the template to the engine until the outcome
pub fn connect_duration(role: &'static str, result: &'static str, millis: u64) {
    metrics::histogram!(
        "wire_connect_duration_ms",
        "role" => role,
        "result" => result
    )
    .record(millis as f64);
}

/// TLS handshake duration
pub fn handshake_duration(result: &'static str, millis: u64) {
    metrics::histogram!("wire_connect_handshake_duration_ms", "result" => result)
        .record(millis as f64);
}
