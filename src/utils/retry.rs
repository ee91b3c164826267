//! Retry utilities: backoff builders for handler redelivery.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::RetryConfig;

/// Backoff for redelivering a message whose handler failed transiently.
pub fn handler_backoff(config: &RetryConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(config.max_retries)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_handler_backoff_is_bounded() {
        let config = RetryConfig {
            min_delay_ms: 1,
            max_delay_ms: 4,
            max_retries: 3,
        };
        let delays: Vec<Duration> = handler_backoff(&config).build().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(10)));
    }
}
