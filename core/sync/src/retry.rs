//! Backoff policies for the retry loops.

use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `base * attempt`, used between push attempts.
    Linear { base: Duration },
    /// `base * 2^attempt` capped at `max`, used for upload retries.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Linear backoff with the given unit.
    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    /// Exponential backoff without jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential {
            base,
            max,
            jitter: false,
        }
    }

    /// Enable or disable jitter (exponential only).
    pub fn with_jitter(self, enabled: bool) -> Self {
        match self {
            Backoff::Exponential { base, max, .. } => Backoff::Exponential {
                base,
                max,
                jitter: enabled,
            },
            linear => linear,
        }
    }

    /// Calculate the delay for a given attempt number.
    ///
    /// For `Linear`, `attempt` is the 1-based number of the attempt that just
    /// failed. For `Exponential`, it is the number of failures before this
    /// one, so the first retry waits `base`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Linear { base } => base.saturating_mul(attempt),
            Backoff::Exponential { base, max, jitter } => {
                let factor = 2u32.saturating_pow(attempt);
                let capped = base.saturating_mul(factor).min(max);

                if jitter {
                    // +/- 25%
                    let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
                    Duration::from_millis((capped.as_millis() as f64 * jitter_factor) as u64)
                } else {
                    capped
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_delays() {
        let backoff = Backoff::linear(Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_exponential_delays() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(10));
        // Overflowing exponents saturate instead of wrapping
        assert_eq!(backoff.delay_for_attempt(64), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let backoff = Backoff::exponential(Duration::from_secs(4), Duration::from_secs(60))
            .with_jitter(true);
        for _ in 0..50 {
            let delay = backoff.delay_for_attempt(0);
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_secs(5));
        }
    }
}
