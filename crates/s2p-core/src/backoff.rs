//! Error classification and retry pacing.
//!
//! Two policies live here: the link's reconnect schedule (1, 2, 4, 8, 16 s,
//! five attempts) and the recognizer's restart schedule (transient errors
//! retry quietly, real errors back off exponentially and eventually stop).

use std::time::Duration;

/// How quickly a transient recognizer error is retried.
const TRANSIENT_RESTART_DELAY: Duration = Duration::from_millis(250);

/// Failure classes per the error-handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected noise (no speech, busy engine). Retry quietly, never surface.
    Transient,
    /// Something is actually wrong (permissions, audio subsystem, network).
    Real,
    /// The engine asked us to slow down. Fixed delay regardless of attempt count.
    RateLimited,
}

/// Exponential backoff for link reconnects.
///
/// Delays are non-decreasing until the cap; the attempt counter resets on
/// any successful reconnect.
#[derive(Debug)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self { base, cap, max_attempts, attempt: 0 }
    }

    /// The delay before the next reconnect attempt, or `None` once attempts
    /// are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base.saturating_mul(1 << self.attempt.min(31));
        self.attempt += 1;
        Some(exp.min(self.cap))
    }

    /// Reset after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// What the recognizer should do after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration },
    /// Too many consecutive real errors; stop and require user action.
    GiveUp,
}

/// Restart pacing for the recognizer.
#[derive(Debug)]
pub struct RestartPolicy {
    base: Duration,
    cap: Duration,
    rate_limit_delay: Duration,
    max_consecutive: u32,
    consecutive: u32,
}

impl RestartPolicy {
    pub fn new(
        base: Duration,
        cap: Duration,
        rate_limit_delay: Duration,
        max_consecutive: u32,
    ) -> Self {
        Self { base, cap, rate_limit_delay, max_consecutive, consecutive: 0 }
    }

    /// Record an error and decide the restart.
    ///
    /// Transient errors do not advance the consecutive counter; rate limits
    /// use their fixed delay without advancing the exponent.
    pub fn on_error(&mut self, class: ErrorClass) -> RestartDecision {
        match class {
            ErrorClass::Transient => RestartDecision::Restart { delay: TRANSIENT_RESTART_DELAY },
            ErrorClass::RateLimited => {
                RestartDecision::Restart { delay: self.rate_limit_delay }
            }
            ErrorClass::Real => {
                self.consecutive += 1;
                if self.consecutive >= self.max_consecutive {
                    return RestartDecision::GiveUp;
                }
                let exp = self.base.saturating_mul(1 << (self.consecutive - 1).min(31));
                RestartDecision::Restart { delay: exp.min(self.cap) }
            }
        }
    }

    /// Any successful recognition clears the streak.
    pub fn on_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn reconnect_delays_double_up_to_cap() {
        let mut policy = ReconnectPolicy::new(secs(1), secs(16), 5);
        let delays: Vec<_> = std::iter::from_fn(|| policy.next_delay()).collect();
        assert_eq!(delays, vec![secs(1), secs(2), secs(4), secs(8), secs(16)]);
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn reconnect_delays_are_monotonic_and_capped() {
        let mut policy = ReconnectPolicy::new(secs(1), secs(10), 8);
        let mut last = Duration::ZERO;
        while let Some(d) = policy.next_delay() {
            assert!(d >= last);
            assert!(d <= secs(10));
            last = d;
        }
    }

    #[test]
    fn reconnect_counter_resets_on_success() {
        let mut policy = ReconnectPolicy::new(secs(1), secs(16), 5);
        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.attempt(), 2);

        policy.reset();
        assert_eq!(policy.attempt(), 0);
        assert_eq!(policy.next_delay(), Some(secs(1)));
    }

    #[test]
    fn transient_errors_retry_quickly_without_counting() {
        let mut policy = RestartPolicy::new(secs(1), secs(30), secs(30), 5);
        for _ in 0..20 {
            match policy.on_error(ErrorClass::Transient) {
                RestartDecision::Restart { delay } => assert!(delay <= secs(1)),
                RestartDecision::GiveUp => panic!("transient errors never give up"),
            }
        }
        assert_eq!(policy.consecutive_errors(), 0);
    }

    #[test]
    fn real_errors_back_off_then_give_up() {
        let mut policy = RestartPolicy::new(secs(1), secs(30), secs(30), 5);
        let mut delays = Vec::new();
        loop {
            match policy.on_error(ErrorClass::Real) {
                RestartDecision::Restart { delay } => delays.push(delay),
                RestartDecision::GiveUp => break,
            }
        }
        assert_eq!(delays, vec![secs(1), secs(2), secs(4), secs(8)]);
        assert_eq!(policy.consecutive_errors(), 5);
    }

    #[test]
    fn rate_limit_uses_fixed_delay() {
        let mut policy = RestartPolicy::new(secs(1), secs(30), secs(30), 5);
        for _ in 0..3 {
            assert_eq!(
                policy.on_error(ErrorClass::RateLimited),
                RestartDecision::Restart { delay: secs(30) }
            );
        }
    }

    #[test]
    fn success_clears_the_streak() {
        let mut policy = RestartPolicy::new(secs(1), secs(30), secs(30), 5);
        policy.on_error(ErrorClass::Real);
        policy.on_error(ErrorClass::Real);
        assert_eq!(policy.consecutive_errors(), 2);

        policy.on_success();
        assert_eq!(policy.consecutive_errors(), 0);
        assert_eq!(
            policy.on_error(ErrorClass::Real),
            RestartDecision::Restart { delay: secs(1) }
        );
    }
}
