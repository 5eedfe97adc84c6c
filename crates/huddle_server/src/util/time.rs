#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Clamped at zero if the clock reads
/// before the epoch.
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unix_ms_now_is_recent() {
		// 2020-01-01 in ms; anything earlier means a broken clock source.
		assert!(unix_ms_now() > 1_577_836_800_000);
	}
}
