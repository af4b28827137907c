//! Restart backoff policy for instances remembered in ERROR state.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::ModelInstance;

const BASE_DELAY_SECS: f64 = 10.0;
const MAX_DELAY_SECS: f64 = 300.0;

/// Backoff delay before restart attempt `restart_count + 1`:
/// `min(10 * 2^(restart_count - 1), 300)` seconds.
///
/// With `restart_count == 0` the exponent is negative and the delay is
/// 5s; kept as-is rather than clamping (see DESIGN.md).
pub fn restart_delay(restart_count: i32) -> Duration {
    let secs = (BASE_DELAY_SECS * 2f64.powi(restart_count - 1)).min(MAX_DELAY_SECS);
    Duration::from_secs_f64(secs)
}

/// Whether an ERROR instance is due for a restart at `now`.
///
/// The delay is counted from `last_restart_time`, falling back to the
/// instance's last update time. With neither timestamp the restart is
/// immediately due.
pub fn restart_due(mi: &ModelInstance, now: DateTime<Utc>) -> bool {
    let delay = restart_delay(mi.restart_count.unwrap_or(0));
    let Some(since) = mi.last_restart_time.or(mi.updated_at) else {
        return true;
    };
    match now.signed_duration_since(since).to_std() {
        Ok(elapsed) => elapsed >= delay,
        // `since` is in the future (clock skew); treat as just restarted.
        Err(_) => false,
    }
}
