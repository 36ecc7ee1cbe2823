#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

const DEFAULT_BASE_SECONDS: u64 = 5;
const DEFAULT_MAX_SECONDS: u64 = 300;

/// Exponential retry delay: `min(max, base * 2^(attempts - 1))` whole seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    base_seconds: u64,
    max_seconds: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackoffPolicyError {
    #[error("base backoff must be >= 1 second")]
    ZeroBase,
    #[error("max backoff ({max_seconds}s) must be >= base backoff ({base_seconds}s)")]
    MaxBelowBase { base_seconds: u64, max_seconds: u64 },
}

impl BackoffPolicy {
    pub fn new(base_seconds: u64, max_seconds: u64) -> Result<Self, BackoffPolicyError> {
        if base_seconds == 0 {
            return Err(BackoffPolicyError::ZeroBase);
        }
        if max_seconds < base_seconds {
            return Err(BackoffPolicyError::MaxBelowBase {
                base_seconds,
                max_seconds,
            });
        }
        Ok(Self {
            base_seconds,
            max_seconds,
        })
    }

    pub fn base_seconds(&self) -> u64 {
        self.base_seconds
    }

    pub fn max_seconds(&self) -> u64 {
        self.max_seconds
    }

    /// `attempts` is the count already incremented by the claim that just failed.
    /// Zero is treated like the first attempt.
    pub fn delay_seconds(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        self.base_seconds
            .saturating_mul(factor)
            .min(self.max_seconds)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_seconds: DEFAULT_BASE_SECONDS,
            max_seconds: DEFAULT_MAX_SECONDS,
        }
    }
}
