//! Exponential backoff shared by credential and egress path cooldowns.

use std::time::{Duration, SystemTime};

/// Largest exponent applied to the base, so the multiplier tops out at 16x.
const MAX_EXPONENT: u32 = 4;

/// Returns the cooldown in seconds for the given failure streak.
///
/// `base * 2^min(fail_streak - 1, 4)`, capped at `max_seconds`. A `max_seconds`
/// of zero leaves the value uncapped and a zero base disables backoff. A streak
/// of zero is treated as one.
pub fn compute_backoff(base_seconds: u64, fail_streak: u32, max_seconds: u64) -> u64 {
    if base_seconds == 0 {
        return 0;
    }

    let exponent = fail_streak.max(1).saturating_sub(1).min(MAX_EXPONENT);
    let seconds = base_seconds.saturating_mul(1 << exponent);

    if max_seconds > 0 {
        seconds.min(max_seconds)
    } else {
        seconds
    }
}

/// Extends a cooldown deadline to `now + seconds`. Never moves it earlier.
pub fn extend_deadline(
    existing: Option<SystemTime>,
    now: SystemTime,
    seconds: u64,
) -> Option<SystemTime> {
    if seconds == 0 {
        return existing;
    }

    let candidate = now + Duration::from_secs(seconds);
    match existing {
        Some(current) if current >= candidate => Some(current),
        _ => Some(candidate),
    }
}

/// Seconds until `deadline`, rounded down. Zero once it has passed.
pub fn remaining_seconds(deadline: Option<SystemTime>, now: SystemTime) -> u64 {
    deadline
        .and_then(|d| d.duration_since(now).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let values: Vec<u64> = (1..=5).map(|s| compute_backoff(8, s, 300)).collect();
        assert_eq!(values, vec![8, 16, 32, 64, 128]);

        // The exponent stops growing after the fifth failure, so streak 6 at
        // base 8 stays at 128 rather than reaching the 300 cap. Only a larger
        // base (below) reaches the cap.
        assert_eq!(compute_backoff(8, 6, 300), 128);
        assert_eq!(compute_backoff(8, 60, 300), 128);

        // The cap wins once the doubled value exceeds it.
        assert_eq!(compute_backoff(30, 5, 300), 300);
        assert_eq!(compute_backoff(10, 3, 120), 40);
        assert_eq!(compute_backoff(10, 5, 120), 120);
    }

    #[test]
    fn test_backoff_edge_cases() {
        assert_eq!(compute_backoff(0, 3, 300), 0);
        assert_eq!(compute_backoff(8, 0, 300), 8);
        // Zero cap means uncapped.
        assert_eq!(compute_backoff(60, 5, 0), 960);
    }

    #[test]
    fn test_extend_deadline_never_shortens() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        let first = extend_deadline(None, now, 60);
        assert_eq!(first, Some(now + Duration::from_secs(60)));

        // A shorter cooldown keeps the longer deadline.
        let second = extend_deadline(first, now, 10);
        assert_eq!(second, first);

        // A later one moves it out.
        let later = now + Duration::from_secs(100);
        let third = extend_deadline(second, later, 10);
        assert_eq!(third, Some(later + Duration::from_secs(10)));

        // Zero seconds leaves whatever was there.
        assert_eq!(extend_deadline(None, now, 0), None);
        assert_eq!(extend_deadline(third, now, 0), third);
    }

    #[test]
    fn test_remaining_seconds() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        assert_eq!(remaining_seconds(None, now), 0);
        assert_eq!(
            remaining_seconds(Some(now + Duration::from_millis(2_500)), now),
            2
        );
        assert_eq!(remaining_seconds(Some(now - Duration::from_secs(5)), now), 0);
    }
}
