//! Explicit retry budget and failure messages.
//!
//! Failures are never re-queued automatically. A failed download goes back to
//! `pending` only through an explicit retry, and only while its budget lasts.

use crate::transfer::TransferError;

/// Default number of explicit retries per download.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Outcome of checking a retry request against the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The retry may proceed; `attempt` is the retry number it will consume.
    Allowed { attempt: u32 },
    /// The budget is spent.
    Exhausted { max_retries: u32 },
}

/// Budget for explicit retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self { max_retries }
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Checks whether a download that already used `retry_count` retries may retry again.
    #[must_use]
    pub fn decide(&self, retry_count: i64) -> RetryDecision {
        let used = u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX);
        if used < self.max_retries {
            RetryDecision::Allowed { attempt: used + 1 }
        } else {
            RetryDecision::Exhausted {
                max_retries: self.max_retries,
            }
        }
    }
}

/// Human-readable failure text stored on the download.
///
/// Format: `<kind>: <error>. <hint>`
#[must_use]
pub fn failure_message(error: &TransferError) -> String {
    let kind = error.kind();
    format!("{kind}: {error}. {}", kind.hint())
}
