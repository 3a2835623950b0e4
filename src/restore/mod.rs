//! Restoring a site from a backup archive: extraction, database replay and
//! file transfer, driven one bounded step at a time by the orchestrator.

pub mod archive;
pub mod batch;
pub mod db;
pub mod download;
pub mod files;
pub mod orchestrator;
pub mod scanner;

use std::time::Duration;

pub use orchestrator::RestoreOrchestrator;

/// Consecutive failed (re)connects tolerated before the restore is aborted.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Memory use, as a share of the budget, above which a batch or step ends early.
pub const MEMORY_LIMIT_RATIO: f64 = 0.8;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before reconnect attempt `attempt` (1-based): `base`, doubling per
/// attempt, capped at one minute.
pub fn reconnect_backoff(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(2);
        assert_eq!(reconnect_backoff(base, 1), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(base, 2), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(base, 4), Duration::from_secs(16));
        assert_eq!(reconnect_backoff(base, 10), MAX_BACKOFF);
        assert_eq!(reconnect_backoff(Duration::ZERO, 5), Duration::ZERO);
    }
}
