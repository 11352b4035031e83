//! Jittered node-state poll timeouts

use rand::Rng;
use std::time::Duration;

/// Pick a poll timeout uniformly in `[max * start / 100, max * stop / 100]`
/// milliseconds, both ends inclusive.
///
/// Spreading the timeouts keeps a fleet that came up together from
/// answering its polls in lockstep.
pub fn jittered_timeout<R: Rng + ?Sized>(
    rng: &mut R,
    max: Duration,
    start_percent: u8,
    stop_percent: u8,
) -> Duration {
    let max_ms = max.as_millis() as u64;
    let low = max_ms * u64::from(start_percent) / 100;
    let high = max_ms * u64::from(stop_percent) / 100;
    if low >= high {
        return Duration::from_millis(low);
    }
    Duration::from_millis(rng.gen_range(low..=high))
}
