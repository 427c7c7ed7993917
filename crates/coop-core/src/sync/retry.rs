//! Retry eligibility for records that failed with an API error

use serde::{Deserialize, Serialize};

use crate::models::{SyncRecord, SyncState};

/// Attempt cap plus exponential backoff.
///
/// Only records in `Error` are subject to the policy; `Pending*` records are
/// always attempted, since a transport failure leaves them untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Stop retrying once `sync_attempts` reaches this value
    pub max_attempts: Option<u32>,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            base_delay_ms: 500,
            max_delay_ms: 5 * 60 * 1000,
        }
    }
}

/// Why a record was not attempted this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    Attempt,
    /// Attempt cap reached; needs a local edit to re-arm
    GaveUp,
    /// Still inside the backoff window
    Backoff { retry_at: i64 },
}

impl RetryPolicy {
    /// Never give up and never wait
    pub const fn unlimited() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before attempt number `attempts + 1`: `base * 2^attempts`, capped
    pub fn backoff_for(&self, attempts: u32) -> u64 {
        if attempts == 0 {
            return 0;
        }
        let factor = 1_u64.checked_shl(attempts.min(63)).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Decide whether `record` may be uploaded at `now`
    pub fn verdict<T>(&self, record: &SyncRecord<T>, now: i64) -> RetryVerdict {
        if record.sync_state != SyncState::Error {
            return RetryVerdict::Attempt;
        }
        if self
            .max_attempts
            .is_some_and(|max| record.sync_attempts >= max)
        {
            return RetryVerdict::GaveUp;
        }
        let Some(last_attempt_at) = record.last_attempt_at else {
            return RetryVerdict::Attempt;
        };
        let delay = i64::try_from(self.backoff_for(record.sync_attempts)).unwrap_or(i64::MAX);
        let retry_at = last_attempt_at.saturating_add(delay);
        if now < retry_at {
            RetryVerdict::Backoff { retry_at }
        } else {
            RetryVerdict::Attempt
        }
    }

    pub fn should_attempt<T>(&self, record: &SyncRecord<T>, now: i64) -> bool {
        self.verdict(record, now) == RetryVerdict::Attempt
    }
}
