//! Time-decayed scoring
//!
//! A correct answer earns the question's full points if it arrives within a
//! short grace window at the start of the question. After that the award
//! decays linearly towards zero at the time limit, but never drops below a
//! floor of one tenth of the points (and never below one point).

use std::time::Duration;

use crate::constants::scoring::{FLOOR_RATIO, GRACE_RATIO};

/// Computes the points for one answer
///
/// # Arguments
///
/// * `correct` - Whether the answer matched the key
/// * `base_points` - Points for an instant correct answer
/// * `time_spent` - Time the player took
/// * `time_limit` - The question's time limit
///
/// # Returns
///
/// `0` for incorrect answers and zero-point questions. Otherwise a value in
/// `[max(1, floor(0.1 * base_points)), base_points]` that never increases as
/// `time_spent` grows.
pub fn score(correct: bool, base_points: u64, time_spent: Duration, time_limit: Duration) -> u64 {
    if !correct || base_points == 0 {
        return 0;
    }

    let limit = time_limit.as_secs_f64();
    let spent = time_spent.as_secs_f64();
    let grace = GRACE_RATIO * limit;
    if limit <= 0.0 || spent <= grace {
        return base_points;
    }

    let ratio = ((limit - spent) / (limit - grace)).max(0.0);
    let floor = ((FLOOR_RATIO * base_points as f64).floor() as u64).max(1);
    let decayed = (base_points as f64 * ratio).round() as u64;

    decayed.clamp(floor, base_points)
}
