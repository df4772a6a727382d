use std::time::Duration;

use rand::Rng;

/// A connection that stayed up this long resets the attempt counter.
pub const RECONNECT_RESET_AFTER: Duration = Duration::from_secs(60 * 5);

const BASE_MS: u64 = 500;
const MAX_MS: u64 = 30_000;

/// Delay before reconnect `attempt` (1-based): exponential with ±10% jitter.
pub fn reconnect_delay(attempt: u32) -> Duration {
	let delay_ms = base_delay_ms(attempt);
	let jitter_window = (delay_ms / 10).max(1);
	let mut rng = rand::rng();
	let jitter_offset = rng.random_range(0..=(jitter_window * 2));
	Duration::from_millis(delay_ms.saturating_sub(jitter_window).saturating_add(jitter_offset))
}

fn base_delay_ms(attempt: u32) -> u64 {
	let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(6));
	BASE_MS.saturating_mul(pow).min(MAX_MS)
}
