//! Metric label values

/// Client-side connect attempt
pub const ROLE_CLIENT: &str = "client";

/// Listener bind attempt
pub const ROLE_SERVER: &str = "server";

/// Successful outcome
pub const RESULT_OK: &str = "ok";

/// Failed outcome
pub const RESULT_ERROR: &str = "error";

/// Cancelled outcome
pub const RESULT_CANCELLED: &str = "cancelled";

/// Timed out
pub const RESULT_TIMEOUT: &str = "timeout";

/// Connection closed by the engine or the caller
pub const TEARDOWN_CLOSED: &str = "closed";

/// Connection handed back to its pool
pub const TEARDOWN_RELEASED: &str = "released";

/// Connection torn down after a failure
pub const TEARDOWN_FAILED: &str = "failed";
