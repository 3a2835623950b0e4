//! Batch sizing. One user-facing speed setting drives every batch size; the
//! database batch then adapts to observed throughput and memory pressure.

use crate::config::{MAX_SPEED, MIN_SPEED, clamp_speed};
use crate::state::BatchSettings;

pub const FILES_BATCH_MIN: usize = 20;
pub const FILES_BATCH_MAX: usize = 300;
pub const DB_BATCH_MIN: usize = 500;
pub const DB_BATCH_MAX: usize = 10_000;
pub const STEPS_MIN: usize = 2;
pub const STEPS_MAX: usize = 20;

/// Hard bounds of the adaptive database batch.
pub const DB_BATCH_FLOOR: usize = 1;
pub const DB_BATCH_CEILING: usize = 10_000;

/// Seconds a database batch should take.
pub const DB_TARGET_SECONDS: f64 = 15.0;

const HIGH_MEMORY: f64 = 0.7;
const LOW_MEMORY: f64 = 0.4;
const SHRINK: f64 = 0.7;
const GROW: f64 = 1.2;

const DIRS_RATIO_START: f64 = 0.7;
const DIRS_RATIO_END: f64 = 0.3;

fn interpolate(speed: u32, min: usize, max: usize) -> usize {
    let speed = clamp_speed(speed);
    let t = f64::from(speed - MIN_SPEED) / f64::from(MAX_SPEED - MIN_SPEED);
    (min as f64 + t * (max - min) as f64).round() as usize
}

/// Batch sizes for a speed setting in [2,25]; out-of-range speeds are clamped.
pub fn settings_for_speed(speed: u32) -> BatchSettings {
    let files_batch_size = interpolate(speed, FILES_BATCH_MIN, FILES_BATCH_MAX);
    let (dirs_share, files_share) = split_shares(files_batch_size, DIRS_RATIO_START);
    BatchSettings {
        speed: clamp_speed(speed),
        files_batch_size,
        dirs_share,
        files_share,
        db_batch_size: interpolate(speed, DB_BATCH_MIN, DB_BATCH_MAX),
        max_steps: interpolate(speed, STEPS_MIN, STEPS_MAX),
    }
}

fn split_shares(total: usize, dirs_ratio: f64) -> (usize, usize) {
    if total == 0 {
        return (0, 0);
    }
    let dirs = if total == 1 {
        1
    } else {
        ((total as f64 * dirs_ratio).round() as usize).clamp(1, total - 1)
    };
    (dirs, total - dirs)
}

/// Splits `total` between directories and files.
///
/// Starts at 70/30 in favour of directories and slides to 30/70 as the
/// directory queue drains. An empty queue gives its whole share to the other.
/// The two shares always sum to `total`.
pub fn rebalance(
    total: usize,
    dirs_remaining: usize,
    dirs_total: usize,
    files_remaining: usize,
) -> (usize, usize) {
    match (dirs_remaining, files_remaining) {
        (0, _) => (0, total),
        (_, 0) => (total, 0),
        _ => {
            let drained = if dirs_total == 0 {
                0.0
            } else {
                dirs_remaining.min(dirs_total) as f64 / dirs_total as f64
            };
            let ratio = DIRS_RATIO_END + (DIRS_RATIO_START - DIRS_RATIO_END) * drained;
            split_shares(total, ratio)
        }
    }
}

/// Next database batch size from the last batch duration and memory use.
pub fn adapt_db_batch(current: usize, last_batch_seconds: f64, memory_ratio: f64) -> usize {
    let mut size = current.max(DB_BATCH_FLOOR) as f64;
    if last_batch_seconds > 0.0 {
        size *= (DB_TARGET_SECONDS / last_batch_seconds).clamp(0.5, 1.5);
    }
    if memory_ratio > HIGH_MEMORY {
        size *= SHRINK;
    } else if memory_ratio < LOW_MEMORY {
        size *= GROW;
    }
    (size.round() as usize).clamp(DB_BATCH_FLOOR, DB_BATCH_CEILING)
}

/// Halved batch sizes used in recovery mode.
pub fn recovery_settings(batch: &BatchSettings) -> BatchSettings {
    let files_batch_size = (batch.files_batch_size / 2).max(1);
    let (dirs_share, files_share) = split_shares(files_batch_size, DIRS_RATIO_START);
    BatchSettings {
        speed: batch.speed,
        files_batch_size,
        dirs_share,
        files_share,
        db_batch_size: (batch.db_batch_size / 2).max(DB_BATCH_FLOOR),
        max_steps: (batch.max_steps / 2).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_interpolation_endpoints() {
        let slow = settings_for_speed(MIN_SPEED);
        assert_eq!(slow.files_batch_size, FILES_BATCH_MIN);
        assert_eq!(slow.db_batch_size, DB_BATCH_MIN);
        assert_eq!(slow.max_steps, STEPS_MIN);

        let fast = settings_for_speed(MAX_SPEED);
        assert_eq!(fast.files_batch_size, FILES_BATCH_MAX);
        assert_eq!(fast.db_batch_size, DB_BATCH_MAX);
        assert_eq!(fast.max_steps, STEPS_MAX);

        assert_eq!(settings_for_speed(0), slow);
        assert_eq!(settings_for_speed(1000), fast);
    }

    #[test]
    fn test_initial_split_favours_directories() {
        for speed in MIN_SPEED..=MAX_SPEED {
            let s = settings_for_speed(speed);
            assert_eq!(s.dirs_share + s.files_share, s.files_batch_size);
            assert!(s.dirs_share > s.files_share);
        }
    }

    #[test]
    fn test_rebalance_always_sums_to_total() {
        for total in [1, 2, 7, 20, 300] {
            for dirs_total in [0, 1, 10, 500] {
                for dirs_remaining in [0, 1, 5, 10, 500] {
                    for files_remaining in [0, 1, 1000] {
                        let (d, f) = rebalance(total, dirs_remaining, dirs_total, files_remaining);
                        assert_eq!(d + f, total);
                    }
                }
            }
        }
    }

    #[test]
    fn test_rebalance_moves_toward_files() {
        let (early_dirs, _) = rebalance(100, 100, 100, 50);
        let (late_dirs, late_files) = rebalance(100, 1, 100, 50);
        assert_eq!(early_dirs, 70);
        assert!(late_dirs < early_dirs);
        assert!(late_files > late_dirs);
        assert_eq!(rebalance(100, 0, 100, 50), (0, 100));
        assert_eq!(rebalance(100, 5, 100, 0), (100, 0));
    }

    #[test]
    fn test_adaptive_db_batch_stays_in_bounds() {
        let mut size = DB_BATCH_MAX;
        for _ in 0..50 {
            size = adapt_db_batch(size, 1.0, 0.1);
            assert!((DB_BATCH_FLOOR..=DB_BATCH_CEILING).contains(&size));
        }
        assert_eq!(size, DB_BATCH_CEILING);
        for _ in 0..50 {
            size = adapt_db_batch(size, 120.0, 0.95);
            assert!((DB_BATCH_FLOOR..=DB_BATCH_CEILING).contains(&size));
        }
        assert_eq!(size, DB_BATCH_FLOOR);
        assert_eq!(adapt_db_batch(0, 0.0, 0.5), 1);
    }

    #[test]
    fn test_adaptive_db_batch_reacts_to_memory() {
        assert_eq!(adapt_db_batch(1000, DB_TARGET_SECONDS, 0.5), 1000);
        assert_eq!(adapt_db_batch(1000, DB_TARGET_SECONDS, 0.8), 700);
        assert_eq!(adapt_db_batch(1000, DB_TARGET_SECONDS, 0.2), 1200);
    }

    #[test]
    fn test_recovery_halves_batches() {
        let normal = settings_for_speed(10);
        let reduced = recovery_settings(&normal);
        assert_eq!(reduced.files_batch_size, normal.files_batch_size / 2);
        assert_eq!(reduced.dirs_share + reduced.files_share, reduced.files_batch_size);
        assert_eq!(reduced.db_batch_size, normal.db_batch_size / 2);
    }
}
