//! Search-size estimation.
//!
//! The exhaustive search visits every set partition of the cart, i.e. the
//! Bell number `B(n)` of candidates. These helpers compute `B(n)` without
//! overflow (saturating at `u128::MAX`) and turn it into a wall-clock
//! estimate using an empirically calibrated per-partition cost.

/// Calibrated cost of evaluating one partition, in seconds.
pub const DEFAULT_SECONDS_PER_PARTITION: f64 = 3e-6;

/// Returns the Bell number `B(n)`, saturating at `u128::MAX`.
///
/// Computed with the Bell triangle: each row starts with the last value of
/// the previous row, and every following value is the sum of its left
/// neighbour and the value above that neighbour.
pub fn bell_number(n: usize) -> u128 {
    if n == 0 {
        return 1;
    }

    let mut row: Vec<u128> = vec![1];
    for _ in 1..n {
        let mut next = Vec::with_capacity(row.len() + 1);
        let mut current = row[row.len() - 1];
        next.push(current);
        for &above in &row {
            current = current.saturating_add(above);
            next.push(current);
        }
        row = next;
    }
    row[row.len() - 1]
}

/// Largest `n` whose Bell number does not exceed `limit`.
pub fn max_items_within(limit: u128) -> usize {
    let mut n = 0;
    while bell_number(n + 1) <= limit && bell_number(n + 1) != u128::MAX {
        n += 1;
    }
    n
}

/// Estimated runtime in seconds for `partitions` candidates.
pub fn estimated_seconds(partitions: u128, seconds_per_partition: f64) -> f64 {
    // u128 -> f64 loses precision but never overflows
    partitions as f64 * seconds_per_partition
}

/// Human readable description of an estimated runtime.
pub fn describe_duration(seconds: f64) -> String {
    if !seconds.is_finite() {
        return "an unbounded amount of time".to_string();
    }
    if seconds < 60.0 {
        format!("{seconds:.2}s")
    } else if seconds < 3600.0 {
        format!("{:.1} min", seconds / 60.0)
    } else if seconds < 86_400.0 {
        format!("{:.1} h", seconds / 3600.0)
    } else {
        format!("{:.1} days", seconds / 86_400.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_bell_numbers() {
        let expected = [1u128, 1, 2, 5, 15, 52, 203, 877, 4140, 21147, 115975];
        for (n, &value) in expected.iter().enumerate() {
            assert_eq!(bell_number(n), value, "B({n})");
        }
    }

    #[test]
    fn larger_bell_numbers() {
        assert_eq!(bell_number(12), 4_213_597);
        assert_eq!(bell_number(15), 1_382_958_545);
        assert_eq!(bell_number(20), 51_724_158_235_372);
    }

    #[test]
    fn bell_numbers_saturate() {
        assert_eq!(bell_number(200), u128::MAX);
    }

    #[test]
    fn max_items_within_limit() {
        assert_eq!(max_items_within(10_000), 8);
        assert_eq!(max_items_within(4_213_597), 12);
        assert_eq!(max_items_within(0), 0);
    }

    #[test]
    fn estimate_scales_linearly() {
        let secs = estimated_seconds(1_000_000, DEFAULT_SECONDS_PER_PARTITION);
        assert!((secs - 3.0).abs() < 1e-9);
    }

    #[test]
    fn describes_durations() {
        assert_eq!(describe_duration(3.0), "3.00s");
        assert_eq!(describe_duration(90.0), "1.5 min");
        assert_eq!(describe_duration(7200.0), "2.0 h");
        assert_eq!(describe_duration(f64::INFINITY), "an unbounded amount of time");
    }
}
