//! Deadline helpers.

use std::time::{Duration, Instant};

/// Offsets past this are clamped to it (about thirty years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Absolute deadline `seconds + nanoseconds` from now.
///
/// `deadline_from_now(0, 0)` is "now", which `post` treats as no deadline.
/// Offsets beyond about thirty years are clamped, so huge inputs yield a
/// deadline that is never reached in practice instead of overflowing.
pub fn deadline_from_now(seconds: u64, nanoseconds: u32) -> Instant {
    let offset = Duration::from_secs(seconds)
        .saturating_add(Duration::from_nanos(u64::from(nanoseconds)))
        .min(FAR_FUTURE);
    let now = Instant::now();
    now.checked_add(offset).unwrap_or(now)
}

/// Signed difference `a - b` in seconds.
pub fn time_diff(a: Instant, b: Instant) -> f64 {
    match a.checked_duration_since(b) {
        Some(ahead) => ahead.as_secs_f64(),
        None => -b.duration_since(a).as_secs_f64(),
    }
}
