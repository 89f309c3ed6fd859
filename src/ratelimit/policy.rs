//! Rate limit policies and the per-action policy table.
//!
//! Every action a host gates carries its own [`Policy`]. The table is built
//! at construction time and read-only afterwards; an action without a policy
//! is not an error — callers treat it as fail-open.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Rate limit policy for a single action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Length of the sliding window in milliseconds
    pub window_ms: u64,
    /// Attempts allowed inside the window
    pub max_attempts: u32,
    /// How long a key stays blocked once the budget is exceeded, in milliseconds
    pub block_ms: u64,
    /// Denial message shown to the caller
    pub message: String,
}

impl Policy {
    /// Create a new policy.
    pub fn new(
        window_ms: u64,
        max_attempts: u32,
        block_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            window_ms,
            max_attempts,
            block_ms,
            message: message.into(),
        }
    }

    /// The sliding window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// The block duration.
    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    /// Oldest attempt timestamp still counted at `now_ms`. The check path
    /// and the sweep both prune with this cutoff.
    pub(crate) fn window_cutoff(&self, now_ms: i64) -> i64 {
        now_ms - self.window_ms as i64
    }

    /// Denial message with the remaining block time appended, rounded up to
    /// whole seconds.
    pub(crate) fn retry_message(&self, remaining_ms: i64) -> String {
        let secs = (remaining_ms.max(0) + 999) / 1_000;
        format!("{} Try again in {} seconds.", self.message, secs)
    }
}

/// Static lookup from action name to its policy.
///
/// String-keyed so hosts can register actions dynamically from
/// configuration. [`PolicyTable::builtin`] carries the default action set.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    policies: HashMap<String, Policy>,
}

impl PolicyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default action set and budgets.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.insert(
            "auth.login",
            Policy::new(MINUTE_MS, 5, 15 * MINUTE_MS, "Too many login attempts."),
        );
        table.insert(
            "auth.register",
            Policy::new(HOUR_MS, 3, HOUR_MS, "Too many registration attempts."),
        );
        table.insert(
            "auth.passwordReset",
            Policy::new(HOUR_MS, 3, HOUR_MS, "Too many password reset attempts."),
        );
        table.insert(
            "api.fileUpload",
            Policy::new(MINUTE_MS, 10, 5 * MINUTE_MS, "Too many file uploads."),
        );
        table.insert(
            "api.dataFetch",
            Policy::new(MINUTE_MS, 100, 2 * MINUTE_MS, "Too many requests."),
        );
        table.insert(
            "general.pageView",
            Policy::new(MINUTE_MS, 200, MINUTE_MS, "Too many page views."),
        );
        table
    }

    /// Register or override the policy for an action.
    pub fn insert(&mut self, action: impl Into<String>, policy: Policy) {
        self.policies.insert(action.into(), policy);
    }

    /// Look up the policy for an action. Absent means the action is
    /// unconfigured, which callers handle as fail-open.
    pub fn lookup(&self, action: &str) -> Option<&Policy> {
        self.policies.get(action)
    }

    /// Number of configured actions.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the table has no actions at all.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Iterate over the configured action names.
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}
