//! Reconnect backoff and error reporting
//!
//! Provides the capped exponential backoff used by sync agents between
//! connection attempts, and categorised error output for the CLI.

use std::time::Duration;

/// Reconnect policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Consecutive failures tolerated before pausing; `None` retries forever
    pub max_attempts: Option<u32>,

    /// Pause after `max_attempts` is exhausted, before the cycle restarts
    pub cooldown: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
            cooldown: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Fixed-interval policy, useful in tests
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
            max_attempts: None,
            cooldown: delay,
        }
    }
}

/// What the agent should do after a failed or lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Wait this long, then try again
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted: surface an error state and wait out the cooldown
    Cooldown(Duration),
}

/// Backoff state for one agent; reset on every successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current = policy.initial_delay;
        Self {
            policy,
            attempts: 0,
            current,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.policy.initial_delay;
    }

    /// Schedule the next attempt. Delays never decrease and never exceed
    /// `max_delay`; once `max_attempts` is reached the next step is a
    /// cooldown, after which the cycle starts again from `initial_delay`.
    pub fn next_step(&mut self) -> RetryStep {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                self.reset();
                return RetryStep::Cooldown(self.policy.cooldown);
            }
        }

        self.attempts += 1;
        let delay = self.current.min(self.policy.max_delay);

        // Exponential backoff
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.policy.backoff_multiplier)
                .min(self.policy.max_delay.as_secs_f64()),
        );

        RetryStep::Retry {
            attempt: self.attempts,
            delay,
        }
    }
}

/// Categorized error types for better handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network-related errors (retryable)
    Network,

    /// Local database / file errors
    Storage,

    /// Configuration errors (not retryable)
    Configuration,

    /// Rejected input, e.g. an empty patient name
    Validation,

    /// Unknown errors
    Unknown,
}

impl ErrorCategory {
    /// Check if this error category is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Network | ErrorCategory::Storage)
    }
}

/// Categorize an error
pub fn categorize_error(error: &anyhow::Error) -> ErrorCategory {
    let error_str = format!("{error:#}").to_lowercase();

    if error_str.contains("config") || error_str.contains("server url") || error_str.contains("port") {
        ErrorCategory::Configuration
    } else if error_str.contains("network")
        || error_str.contains("connection")
        || error_str.contains("timed out")
        || error_str.contains("address")
    {
        ErrorCategory::Network
    } else if error_str.contains("database")
        || error_str.contains("sqlite")
        || error_str.contains("directory")
        || error_str.contains("permission")
    {
        ErrorCategory::Storage
    } else if error_str.contains("invalid") || error_str.contains("not permitted") {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Unknown
    }
}

/// Enhanced error with context and suggestions
#[derive(Debug)]
pub struct EnhancedError {
    pub error: anyhow::Error,
    pub category: ErrorCategory,
    pub suggestions: Vec<String>,
}

impl EnhancedError {
    /// Create an enhanced error
    pub fn new(error: anyhow::Error) -> Self {
        let category = categorize_error(&error);
        let suggestions = suggestions_for(&category);

        Self {
            error,
            category,
            suggestions,
        }
    }

    /// Display the error with all context
    pub fn display(&self) -> String {
        let mut output = format!("Error: {:#}\n", self.error);

        if !self.suggestions.is_empty() {
            output.push_str("\nSuggestions:\n");
            for suggestion in &self.suggestions {
                output.push_str(&format!("   • {}\n", suggestion));
            }
        }

        output
    }
}

fn suggestions_for(category: &ErrorCategory) -> Vec<String> {
    let hints: &[&str] = match category {
        ErrorCategory::Network => &[
            "Check that the relay hub is running and reachable",
            "Verify the server URL host and port in your config",
        ],
        ErrorCategory::Storage => &[
            "Check permissions on the data directory",
            "Ensure sufficient disk space",
        ],
        ErrorCategory::Configuration => &[
            "Review your configuration file (queue-relay config show)",
            "Server URL must look like 192.168.1.11:8080",
        ],
        ErrorCategory::Validation => &["Review the command arguments"],
        ErrorCategory::Unknown => &["Re-run with RUST_LOG=queue_relay=debug for details"],
    };
    hints.iter().map(|s| s.to_string()).collect()
}

/// Convert regular Result to an enhanced one
pub trait ToEnhanced<T> {
    fn enhance(self) -> Result<T, EnhancedError>;
}

impl<T, E: Into<anyhow::Error>> ToEnhanced<T> for Result<T, E> {
    fn enhance(self) -> Result<T, EnhancedError> {
        self.map_err(|e| EnhancedError::new(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delays(backoff: &mut Backoff, n: usize) -> Vec<Duration> {
        (0..n)
            .map(|_| match backoff.next_step() {
                RetryStep::Retry { delay, .. } => delay,
                RetryStep::Cooldown(d) => d,
            })
            .collect()
    }

    #[test]
    fn test_default_policy_matches_kiosk_defaults() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        let d = delays(&mut backoff, 3);
        assert_eq!(d[0], Duration::from_millis(2000));
        assert_eq!(d[1], Duration::from_millis(3000));
        assert_eq!(d[2], Duration::from_millis(4500));
    }

    #[test]
    fn test_delays_non_decreasing_and_capped() {
        let policy = ReconnectPolicy {
            max_attempts: None,
            ..Default::default()
        };
        let max = policy.max_delay;
        let mut backoff = Backoff::new(policy);
        let d = delays(&mut backoff, 40);
        assert!(d.windows(2).all(|w| w[0] <= w[1]));
        assert!(d.iter().all(|&x| x <= max));
        assert_eq!(*d.last().unwrap(), max);
    }

    #[test]
    fn test_cooldown_after_max_attempts_then_restart() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            cooldown: Duration::from_secs(90),
            ..Default::default()
        };
        let mut backoff = Backoff::new(policy);
        for expected in 1..=3 {
            assert!(matches!(backoff.next_step(), RetryStep::Retry { attempt, .. } if attempt == expected));
        }
        assert_eq!(backoff.next_step(), RetryStep::Cooldown(Duration::from_secs(90)));
        assert_eq!(
            backoff.next_step(),
            RetryStep::Retry {
                attempt: 1,
                delay: Duration::from_millis(2000)
            }
        );
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        delays(&mut backoff, 5);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(delays(&mut backoff, 1)[0], Duration::from_millis(2000));
    }

    #[test]
    fn test_error_categorization() {
        let net_err = anyhow::anyhow!("Connection refused");
        assert_eq!(categorize_error(&net_err), ErrorCategory::Network);

        let cfg_err = anyhow::anyhow!("Server URL must include port");
        assert_eq!(categorize_error(&cfg_err), ErrorCategory::Configuration);

        let db_err = anyhow::anyhow!("failed to create data directory /x");
        assert_eq!(categorize_error(&db_err), ErrorCategory::Storage);

        let input_err = anyhow::anyhow!("invalid patient name: must not be empty");
        assert_eq!(categorize_error(&input_err), ErrorCategory::Validation);
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorCategory::Network.is_retryable());
        assert!(!ErrorCategory::Configuration.is_retryable());
    }

    #[test]
    fn test_enhanced_display_lists_suggestions() {
        let err: Result<(), anyhow::Error> = Err(anyhow::anyhow!("Connection refused"));
        let enhanced = err.enhance().unwrap_err();
        let text = enhanced.display();
        assert!(text.contains("Connection refused"));
        assert!(text.contains("relay hub"));
    }
}
