//! Shared time budget helpers for bounded blocking calls.

use std::time::{Duration, Instant};

/// Return the remaining time until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

/// Clamp a per-call timeout to an optional run deadline.
///
/// Returns `None` when the deadline has already elapsed.
pub fn bounded_timeout(timeout: Duration, deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        Some(deadline) => remaining_budget(deadline).map(|left| left.min(timeout)),
        None => Some(timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_deadline_has_no_budget() {
        let past = Instant::now() - Duration::from_millis(5);
        assert_eq!(remaining_budget(past), None);
        assert_eq!(bounded_timeout(Duration::from_secs(1), Some(past)), None);
    }

    #[test]
    fn timeout_is_clamped_to_deadline() {
        let deadline = Instant::now() + Duration::from_secs(2);
        let bounded = bounded_timeout(Duration::from_secs(60), Some(deadline)).expect("budget");
        assert!(bounded <= Duration::from_secs(2));

        let bounded = bounded_timeout(Duration::from_millis(10), Some(deadline)).expect("budget");
        assert_eq!(bounded, Duration::from_millis(10));
    }

    #[test]
    fn no_deadline_keeps_timeout() {
        assert_eq!(
            bounded_timeout(Duration::from_secs(3), None),
            Some(Duration::from_secs(3))
        );
    }
}
