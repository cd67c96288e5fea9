//! Bounded retry policy shared by stop, start and download.

use serde::{Deserialize, Serialize};

/// Attempt count: 1 normally, 3 when the caller asked for retries.
/// Attempts follow each other without backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    attempts: u32,
}

impl RetryPolicy {
    pub const RETRY_ATTEMPTS: u32 = 3;

    pub fn from_flag(retry: bool) -> Self {
        Self {
            attempts: if retry { Self::RETRY_ATTEMPTS } else { 1 },
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 1-based attempt numbers.
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        1..=self.attempts
    }

    pub fn is_final(&self, attempt: u32) -> bool {
        attempt >= self.attempts
    }

    /// Suffix for the final failure message, e.g. `after 3 attempts`.
    pub fn describe(&self) -> String {
        match self.attempts {
            1 => "after 1 attempt".to_string(),
            n => format!("after {n} attempts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_counts() {
        assert_eq!(RetryPolicy::from_flag(false).attempts(), 1);
        assert_eq!(RetryPolicy::from_flag(true).attempts(), 3);
        assert_eq!(RetryPolicy::from_flag(true).iter().count(), 3);
    }

    #[test]
    fn test_final_attempt_and_message() {
        let policy = RetryPolicy::from_flag(true);
        assert!(!policy.is_final(2));
        assert!(policy.is_final(3));
        assert_eq!(policy.describe(), "after 3 attempts");
        assert_eq!(RetryPolicy::from_flag(false).describe(), "after 1 attempt");
    }
}
