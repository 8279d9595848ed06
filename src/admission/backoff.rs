use std::time::Duration;

pub use tokio_retry::strategy::ExponentialBackoff;

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterMode {
    /// No jitter.
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the delay calculated by the
    /// backoff strategy.
    #[default]
    Full,
}

impl JitterMode {
    fn apply(self, delay: Duration) -> Duration {
        match self {
            JitterMode::None => delay,
            JitterMode::Full => {
                if delay.is_zero() {
                    return Duration::ZERO;
                }
                delay.mul_f64(rand::random::<f64>())
            }
        }
    }
}

/// Caller-side retry policy for [`AdmissionError::Inadmissible`] claims.
///
/// The engine never retries on its own; this only spaces out a caller's
/// repeated claims. Cancellation and shutdown errors are never retried.
///
/// [`AdmissionError::Inadmissible`]: super::AdmissionError::Inadmissible
#[derive(Debug, Clone)]
pub struct ClaimRetry {
    max_attempts: usize,
    backoff: ExponentialBackoff,
    jitter: JitterMode,
}

impl ClaimRetry {
    /// `max_attempts` counts the first claim, so `1` never retries.
    pub fn new(max_attempts: usize, backoff: ExponentialBackoff, jitter: JitterMode) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            jitter,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub(crate) fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let jitter = self.jitter;
        self.backoff.clone().map(move |delay| jitter.apply(delay))
    }
}

impl Default for ClaimRetry {
    /// Four attempts, 100ms then doubling, capped at 5s, with full jitter.
    fn default() -> Self {
        Self::new(
            4,
            ExponentialBackoff::from_millis(2)
                .factor(50)
                .max_delay(Duration::from_secs(5)),
            JitterMode::Full,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_backs_off_to_five_seconds() {
        let retry = ClaimRetry {
            jitter: JitterMode::None,
            ..ClaimRetry::default()
        };
        assert_eq!(retry.max_attempts(), 4);
        let delays: Vec<_> = retry.delays().take(8).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 800, 1600, 3200, 5000, 5000]
                .map(Duration::from_millis)
                .to_vec()
        );
    }

    #[test]
    fn jitter_stays_within_delay() {
        let retry = ClaimRetry::new(
            10,
            ExponentialBackoff::from_millis(2).factor(50),
            JitterMode::Full,
        );
        let ceilings = ExponentialBackoff::from_millis(2).factor(50);
        for (delay, ceiling) in retry.delays().zip(ceilings).take(8) {
            assert!(delay <= ceiling, "{delay:?} exceeds {ceiling:?}");
        }
    }

    #[test]
    fn no_jitter_is_exact() {
        let retry = ClaimRetry::new(3, ExponentialBackoff::from_millis(3), JitterMode::None);
        let delays: Vec<_> = retry.delays().take(3).collect();
        assert_eq!(delays, [3, 9, 27].map(Duration::from_millis).to_vec());
    }

    #[test]
    fn at_least_one_attempt() {
        let retry = ClaimRetry::new(0, ExponentialBackoff::from_millis(1), JitterMode::None);
        assert_eq!(retry.max_attempts(), 1);
    }
}
