use std::time::Duration;
use tideway_core::config::DispatchConfig;

/// Delay schedule between retry attempts
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed(Duration),

    /// `initial * 2^attempt`, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Strategy described by the dispatch configuration
    pub fn from_config(config: &DispatchConfig) -> Self {
        BackoffStrategy::Exponential {
            initial: config.backoff_initial(),
            max: config.backoff_max(),
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn calculate(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Exponential { initial, max } => {
                let multiplier = 2u32.saturating_pow(attempt);
                initial.saturating_mul(multiplier).min(*max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_is_capped() {
        let backoff = BackoffStrategy::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.calculate(0), Duration::from_millis(100));
        assert_eq!(backoff.calculate(1), Duration::from_millis(200));
        assert_eq!(backoff.calculate(3), Duration::from_millis(800));
        assert_eq!(backoff.calculate(4), Duration::from_secs(1));
        assert_eq!(backoff.calculate(60), Duration::from_secs(1));
    }

    #[test]
    fn test_from_config() {
        let config = DispatchConfig::new().with_backoff_ms(10, 50);
        assert_eq!(
            BackoffStrategy::from_config(&config),
            BackoffStrategy::Exponential {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
            }
        );
        assert_eq!(BackoffStrategy::Fixed(Duration::ZERO).calculate(9), Duration::ZERO);
    }
}
