//! Limit decisions and their HTTP-style projection.

use serde::Serialize;

use super::policy::Policy;

/// Retry horizon reported when the engine itself fails (fail closed).
pub(crate) const FAIL_CLOSED_RETRY_MS: i64 = 60_000;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Outcome of a limit check.
///
/// Serializes to the shape hosts project onto their own boundary:
/// `remaining` is `null` when the action has no configured limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the attempt may proceed
    pub allowed: bool,
    /// Attempts left in the window; `None` when the action is unlimited
    pub remaining: Option<u32>,
    /// Epoch milliseconds when the window resets or the block lifts
    #[serde(rename = "resetTime")]
    pub reset_ms: i64,
    /// Denial reason, present on denied decisions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// True when the denial comes from an active block
    #[serde(skip_serializing_if = "is_false")]
    pub blocked: bool,
    /// True when the denial reflects an engine fault rather than a limit
    #[serde(skip_serializing_if = "is_false")]
    pub error: bool,
}

impl Decision {
    /// The attempt was recorded and may proceed.
    pub(crate) fn allowed(remaining: u32, reset_ms: i64) -> Self {
        Self {
            allowed: true,
            remaining: Some(remaining),
            reset_ms,
            message: None,
            blocked: false,
            error: false,
        }
    }

    /// No policy covers the action: allowed with no limit (fail open).
    pub(crate) fn unlimited(now_ms: i64) -> Self {
        Self {
            allowed: true,
            remaining: None,
            reset_ms: now_ms,
            message: None,
            blocked: false,
            error: false,
        }
    }

    /// The key is blocked until `until_ms`.
    pub(crate) fn blocked(until_ms: i64, message: String) -> Self {
        Self {
            allowed: false,
            remaining: Some(0),
            reset_ms: until_ms,
            message: Some(message),
            blocked: true,
            error: false,
        }
    }

    /// The engine hit an internal fault: deny with a short fixed retry
    /// horizon so the host can distinguish limiter health from limiting.
    pub(crate) fn engine_failure(now_ms: i64) -> Self {
        Self {
            allowed: false,
            remaining: Some(0),
            reset_ms: now_ms + FAIL_CLOSED_RETRY_MS,
            message: Some("Rate limiter error. Try again later.".to_string()),
            blocked: false,
            error: true,
        }
    }
}

/// Protocol-style projection of a limit state: the four fields a host
/// typically attaches as response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    /// Attempt budget inside the window
    pub limit: u32,
    /// Attempts left in the window
    pub remaining: u32,
    /// Epoch seconds when the window resets or the block lifts
    pub reset_secs: i64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl RateLimitHeaders {
    pub(crate) fn new(policy: &Policy, remaining: u32, reset_ms: i64) -> Self {
        Self {
            limit: policy.max_attempts,
            remaining,
            // Rounded up so clients do not retry a tick early.
            reset_secs: (reset_ms + 999) / 1_000,
            window_secs: policy.window_ms / 1_000,
        }
    }

    /// Header name/value pairs in emission order.
    pub fn as_pairs(&self) -> [(&'static str, String); 4] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_secs.to_string()),
            ("X-RateLimit-Window", self.window_secs.to_string()),
        ]
    }
}
