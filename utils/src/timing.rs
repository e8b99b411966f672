// Timekeeping helpers for the logging infrastructure
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch. Used to stamp log records.
pub fn get_current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is before the unix epoch")
        .as_millis() as u64
}
