use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Elapsed milliseconds since an epoch-ms timestamp, saturating at zero.
pub fn elapsed_ms_since(epoch_ms: u64) -> u64 {
    get_epoch_time_in_ms().saturating_sub(epoch_ms)
}
