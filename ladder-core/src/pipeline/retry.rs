//! Table-driven retry policies, one row per stage.

use std::time::Duration;

use crate::domain::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Wall-clock bound per attempt.
    pub attempt_timeout: Duration,
    /// A stage whose last heartbeat is older than this fails the attempt.
    pub heartbeat_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn for_stage(stage: Stage) -> RetryPolicy {
        match stage {
            Stage::Transcoding => RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_secs(10),
                max_backoff: Duration::from_secs(5 * 60),
                attempt_timeout: Duration::from_secs(12 * 3600),
                heartbeat_timeout: Some(Duration::from_secs(5 * 60)),
            },
            Stage::Uploading => RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_secs(5),
                max_backoff: Duration::from_secs(2 * 60),
                attempt_timeout: Duration::from_secs(2 * 3600),
                heartbeat_timeout: Some(Duration::from_secs(60)),
            },
            _ => RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(60),
                attempt_timeout: Duration::from_secs(6 * 3600),
                heartbeat_timeout: Some(Duration::from_secs(60)),
            },
        }
    }

    /// Exponential backoff for a 1-based attempt number, capped at
    /// `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let delay = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcode_policy_is_patient() {
        let policy = RetryPolicy::for_stage(Stage::Transcoding);
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.attempt_timeout, Duration::from_secs(43_200));
        assert_eq!(policy.heartbeat_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn upload_policy_retries_five_times() {
        let policy = RetryPolicy::for_stage(Stage::Uploading);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
        // Capped at two minutes.
        assert_eq!(policy.backoff(10), Duration::from_secs(120));
    }

    #[test]
    fn default_policy_backs_off_exponentially_to_a_minute() {
        let policy = RetryPolicy::for_stage(Stage::MetadataExtraction);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(7), Duration::from_secs(60));
        assert_eq!(policy.backoff(100), Duration::from_secs(60));
    }
}
