//! Core limiter engine: per-key attempt accounting and temporary blocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::PalisadeConfig;
use crate::error::PalisadeError;

use super::decision::{Decision, RateLimitHeaders};
use super::key::{LimitKey, DEFAULT_IDENTIFIER};
use super::policy::{Policy, PolicyTable};

/// Per-key tracking state. The attempt log and the block record share one
/// entry so a check mutates both under a single lock acquisition.
#[derive(Debug, Clone, Default)]
struct KeyState {
    /// Attempt timestamps in epoch milliseconds, append-only
    attempts: Vec<i64>,
    /// Epoch milliseconds until which the key is blocked
    blocked_until: Option<i64>,
}

impl KeyState {
    /// Drop attempts at or before the window cutoff.
    fn prune(&mut self, cutoff_ms: i64) {
        self.attempts.retain(|&t| t > cutoff_ms);
    }

    /// Attempts still inside the window, without mutating the log.
    fn live_attempts(&self, cutoff_ms: i64) -> usize {
        self.attempts.iter().filter(|&&t| t > cutoff_ms).count()
    }

    /// The active block expiry, if one is still in force.
    fn live_block(&self, now_ms: i64) -> Option<i64> {
        self.blocked_until.filter(|&until| now_ms < until)
    }

    /// Clear a block that has lapsed.
    fn drop_expired_block(&mut self, now_ms: i64) {
        if self.blocked_until.is_some_and(|until| now_ms >= until) {
            self.blocked_until = None;
        }
    }

    /// True once there is nothing left worth tracking.
    fn is_idle(&self) -> bool {
        self.attempts.is_empty() && self.blocked_until.is_none()
    }
}

/// Read-only diagnostic view of a single tracked key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitInfo {
    /// The policy governing the action
    pub policy: Policy,
    /// Attempt log entries currently stored for the key
    pub requests: usize,
    /// Whether a block is in force
    pub blocked: bool,
    /// Block expiry in epoch milliseconds, when blocked
    pub blocked_until_ms: Option<i64>,
}

/// Per-key entry of the full registry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeySnapshot {
    /// Attempt log entries currently stored
    pub requests: usize,
    /// Timestamp of the most recent attempt
    pub last_request_ms: Option<i64>,
    /// Whether a block is in force
    pub blocked: bool,
}

/// Aggregate counters across the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    /// Attempt log entries stored across all keys
    pub total_requests: u64,
    /// Keys with a block currently in force
    pub active_blocks: usize,
    /// Keys currently tracked
    pub tracked_keys: usize,
    /// Breakdown by action
    pub per_action: HashMap<String, ActionStats>,
}

/// Per-action slice of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionStats {
    /// Attempt log entries stored for this action
    pub requests: u64,
    /// Keys tracked for this action
    pub tracked_keys: usize,
    /// Keys blocked for this action
    pub blocked_keys: usize,
}

/// The limiter engine owning the tracked-key registry.
///
/// A single coarse lock guards the registry, which keeps the
/// read-prune-compare-append transaction of a check atomic per key. All
/// operations are synchronous and bounded by registry size; share the engine
/// across tasks behind an `Arc`.
pub struct LimiterEngine {
    /// Per-action policies, read-only after construction
    policies: PolicyTable,
    /// Tracked keys: attempt logs and block records
    registry: RwLock<HashMap<LimitKey, KeyState>>,
    /// Time source
    clock: Arc<dyn Clock>,
}

impl LimiterEngine {
    /// Create an engine over the given policy table, on the system clock.
    pub fn new(policies: PolicyTable) -> Self {
        Self::with_clock(policies, Arc::new(SystemClock::new()))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(policies: PolicyTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies,
            registry: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Create an engine from configuration (builtin policies plus any
    /// configured overrides).
    pub fn from_config(config: &PalisadeConfig) -> Self {
        Self::new(config.policy_table())
    }

    /// The policy table this engine consults.
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Decide whether `identifier` may perform `action` right now, recording
    /// the attempt when it is allowed.
    ///
    /// This is the gate call and the only state-mutating read path. It never
    /// panics and never returns `Err`: an internal fault surfaces as a
    /// denied decision with `error = true` (fail closed), while an action
    /// with no configured policy is allowed unlimited (fail open).
    pub fn check(&self, action: &str, identifier: &str) -> Decision {
        let now = self.clock.now_ms();
        match self.try_check(action, identifier, now) {
            Ok(decision) => decision,
            Err(e) => {
                error!(action, identifier, error = %e, "limit check failed, denying request");
                Decision::engine_failure(now)
            }
        }
    }

    /// [`check`](Self::check) against the caller-agnostic identifier, for
    /// actions accounted globally rather than per caller.
    pub fn check_anonymous(&self, action: &str) -> Decision {
        self.check(action, DEFAULT_IDENTIFIER)
    }

    fn try_check(
        &self,
        action: &str,
        identifier: &str,
        now: i64,
    ) -> Result<Decision, PalisadeError> {
        if action.is_empty() || identifier.is_empty() {
            return Err(PalisadeError::InvalidKey(format!(
                "{}:{}",
                action, identifier
            )));
        }

        let Some(policy) = self.policies.lookup(action) else {
            warn!(action, "no policy configured for action, allowing (fail open)");
            return Ok(Decision::unlimited(now));
        };

        let key = LimitKey::new(action, identifier);
        let mut registry = self.registry.write();
        let state = registry.entry(key).or_default();

        // A live block wins over everything; the log stays frozen.
        if let Some(until) = state.live_block(now) {
            trace!(action, identifier, until_ms = until, "key is blocked");
            return Ok(Decision::blocked(until, policy.retry_message(until - now)));
        }
        state.drop_expired_block(now);

        state.prune(policy.window_cutoff(now));

        if state.attempts.len() as u32 >= policy.max_attempts {
            let until = now + policy.block_ms as i64;
            state.blocked_until = Some(until);
            debug!(
                action,
                identifier,
                until_ms = until,
                "attempt budget exceeded, blocking key"
            );
            return Ok(Decision::blocked(until, policy.message.clone()));
        }

        state.attempts.push(now);
        let remaining = policy.max_attempts - state.attempts.len() as u32;
        trace!(action, identifier, remaining, "attempt allowed");
        Ok(Decision::allowed(
            remaining,
            now + policy.window_ms as i64,
        ))
    }

    /// Whether the key is currently blocked. A lapsed block record is
    /// deleted on the way through, so a `false` answer also reclaims memory.
    pub fn is_blocked(&self, action: &str, identifier: &str) -> bool {
        let now = self.clock.now_ms();
        let key = LimitKey::new(action, identifier);
        let mut registry = self.registry.write();
        let Some(state) = registry.get_mut(&key) else {
            return false;
        };
        if state.live_block(now).is_some() {
            return true;
        }
        state.drop_expired_block(now);
        if state.is_idle() {
            registry.remove(&key);
        }
        false
    }

    /// Unconditionally block the key for `duration`, overwriting any active
    /// block (administrative surface — this can shorten an existing block).
    pub fn block(&self, action: &str, identifier: &str, duration: Duration) {
        let now = self.clock.now_ms();
        let until = now + duration.as_millis() as i64;
        let key = LimitKey::new(action, identifier);
        debug!(%key, until_ms = until, "installing administrative block");
        self.registry.write().entry(key).or_default().blocked_until = Some(until);
    }

    /// Forget everything tracked for the key: the attempt log and any block.
    /// Idempotent; the next check starts a completely fresh window.
    pub fn unblock(&self, action: &str, identifier: &str) {
        let key = LimitKey::new(action, identifier);
        if self.registry.write().remove(&key).is_some() {
            debug!(%key, "key unblocked and forgotten");
        }
    }

    /// Read-only diagnostic snapshot for one key, or `None` when the action
    /// has no policy. Unlike [`check`](Self::check), this records nothing.
    pub fn limit_info(&self, action: &str, identifier: &str) -> Option<LimitInfo> {
        let policy = self.policies.lookup(action)?;
        let now = self.clock.now_ms();
        let key = LimitKey::new(action, identifier);
        let registry = self.registry.read();
        let state = registry.get(&key);

        let blocked_until = state.and_then(|s| s.live_block(now));
        Some(LimitInfo {
            policy: policy.clone(),
            requests: state.map_or(0, |s| s.attempts.len()),
            blocked: blocked_until.is_some(),
            blocked_until_ms: blocked_until,
        })
    }

    /// Full registry snapshot, action → identifier → key state. O(tracked
    /// keys); meant for observability tooling, not the request path.
    pub fn all_limits(&self) -> HashMap<String, HashMap<String, KeySnapshot>> {
        let now = self.clock.now_ms();
        let registry = self.registry.read();
        let mut out: HashMap<String, HashMap<String, KeySnapshot>> = HashMap::new();
        for (key, state) in registry.iter() {
            out.entry(key.action.clone()).or_default().insert(
                key.identifier.clone(),
                KeySnapshot {
                    requests: state.attempts.len(),
                    last_request_ms: state.attempts.last().copied(),
                    blocked: state.live_block(now).is_some(),
                },
            );
        }
        out
    }

    /// Sweep the registry: prune each attempt log by its policy window, drop
    /// lapsed blocks, and evict keys with nothing left to track.
    ///
    /// Checks prune their own key as they go, so the sweep exists to bound
    /// memory for keys that went idle, not for correctness.
    pub fn cleanup(&self) {
        let now = self.clock.now_ms();
        let mut registry = self.registry.write();
        let before = registry.len();
        registry.retain(|key, state| {
            if let Some(policy) = self.policies.lookup(&key.action) {
                state.prune(policy.window_cutoff(now));
            }
            state.drop_expired_block(now);
            !state.is_idle()
        });
        let evicted = before - registry.len();
        if evicted > 0 {
            debug!(evicted, remaining = registry.len(), "swept idle limit keys");
        }
    }

    /// Aggregate counters across the registry. O(tracked keys); diagnostic
    /// only.
    pub fn stats(&self) -> EngineStats {
        let now = self.clock.now_ms();
        let registry = self.registry.read();
        let mut stats = EngineStats {
            tracked_keys: registry.len(),
            ..Default::default()
        };
        for (key, state) in registry.iter() {
            let blocked = state.live_block(now).is_some();
            stats.total_requests += state.attempts.len() as u64;
            if blocked {
                stats.active_blocks += 1;
            }
            let action = stats.per_action.entry(key.action.clone()).or_default();
            action.requests += state.attempts.len() as u64;
            action.tracked_keys += 1;
            if blocked {
                action.blocked_keys += 1;
            }
        }
        stats
    }

    /// Read-only header projection for the key, or `None` when the action
    /// has no policy. Unlike [`check_with_headers`](Self::check_with_headers)
    /// this does not spend an attempt; use it to decorate responses.
    pub fn headers(&self, action: &str, identifier: &str) -> Option<RateLimitHeaders> {
        let policy = self.policies.lookup(action)?;
        let now = self.clock.now_ms();
        let key = LimitKey::new(action, identifier);
        let registry = self.registry.read();
        let state = registry.get(&key);

        if let Some(until) = state.and_then(|s| s.live_block(now)) {
            return Some(RateLimitHeaders::new(policy, 0, until));
        }

        let live = state.map_or(0, |s| s.live_attempts(policy.window_cutoff(now))) as u32;
        Some(RateLimitHeaders::new(
            policy,
            policy.max_attempts.saturating_sub(live),
            now + policy.window_ms as i64,
        ))
    }

    /// Run the gate check and project the result as headers. This spends an
    /// attempt exactly like [`check`](Self::check); callers that only want
    /// to look should use [`headers`](Self::headers) instead.
    pub fn check_with_headers(
        &self,
        action: &str,
        identifier: &str,
    ) -> (Decision, Option<RateLimitHeaders>) {
        let decision = self.check(action, identifier);
        let headers = self
            .policies
            .lookup(action)
            .map(|policy| RateLimitHeaders::new(policy, decision.remaining.unwrap_or(0), decision.reset_ms));
        (decision, headers)
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.registry.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn test_engine() -> (LimiterEngine, Arc<ManualClock>) {
        let mut table = PolicyTable::new();
        table.insert("op.test", Policy::new(1_000, 2, 5_000, "Too many attempts."));
        table.insert("op.other", Policy::new(60_000, 5, 60_000, "Too many requests."));
        let clock = Arc::new(ManualClock::new(0));
        let engine = LimiterEngine::with_clock(table, clock.clone());
        (engine, clock)
    }

    #[test]
    fn test_budget_consumed_then_blocked() {
        let (engine, _clock) = test_engine();

        for expected_remaining in [1, 0] {
            let d = engine.check("op.test", "u1");
            assert!(d.allowed);
            assert_eq!(d.remaining, Some(expected_remaining));
        }

        let d = engine.check("op.test", "u1");
        assert!(!d.allowed);
        assert!(d.blocked);
        assert_eq!(d.remaining, Some(0));
        assert_eq!(d.message.as_deref(), Some("Too many attempts."));
    }

    #[test]
    fn test_block_scenario_end_to_end() {
        let (engine, clock) = test_engine();

        let d1 = engine.check("op.test", "u1");
        assert!(d1.allowed);
        assert_eq!(d1.remaining, Some(1));
        assert_eq!(d1.reset_ms, 1_000);

        clock.set(100);
        let d2 = engine.check("op.test", "u1");
        assert!(d2.allowed);
        assert_eq!(d2.remaining, Some(0));

        clock.set(200);
        let d3 = engine.check("op.test", "u1");
        assert!(!d3.allowed);
        assert!(d3.blocked);
        assert_eq!(d3.reset_ms, 5_200);
        assert_eq!(d3.message.as_deref(), Some("Too many attempts."));

        // The original window has lapsed but the block has not.
        clock.set(1_300);
        let d4 = engine.check("op.test", "u1");
        assert!(!d4.allowed);
        assert!(d4.blocked);
        assert_eq!(d4.reset_ms, 5_200);
        assert_eq!(
            d4.message.as_deref(),
            Some("Too many attempts. Try again in 4 seconds.")
        );

        clock.set(5_300);
        let d5 = engine.check("op.test", "u1");
        assert!(d5.allowed);
        assert_eq!(d5.remaining, Some(1));
    }

    #[test]
    fn test_blocked_key_stays_blocked_with_monotonic_reset() {
        let (engine, clock) = test_engine();
        engine.check("op.test", "u1");
        engine.check("op.test", "u1");
        let tripped = engine.check("op.test", "u1");
        assert!(tripped.blocked);
        assert_eq!(tripped.reset_ms, 5_000);

        let mut last_gap = i64::MAX;
        for t in [300, 1_300, 3_000, 4_999] {
            clock.set(t);
            let d = engine.check("op.test", "u1");
            assert!(d.blocked);
            assert_eq!(d.reset_ms, 5_000);
            let gap = d.reset_ms - t;
            assert!(gap <= last_gap);
            last_gap = gap;
        }
    }

    #[test]
    fn test_blocked_checks_do_not_touch_log() {
        let (engine, clock) = test_engine();
        engine.check("op.test", "u1");
        engine.check("op.test", "u1");
        engine.check("op.test", "u1"); // trips the block

        clock.set(500);
        for _ in 0..10 {
            assert!(!engine.check("op.test", "u1").allowed);
        }

        let info = engine.limit_info("op.test", "u1").unwrap();
        assert_eq!(info.requests, 2);
        assert!(info.blocked);
    }

    #[test]
    fn test_window_pruning_frees_budget() {
        let (engine, clock) = test_engine();
        engine.check("op.test", "u1");
        clock.set(900);
        engine.check("op.test", "u1");

        // The first attempt (t=0) ages out of the 1s window.
        clock.set(1_100);
        let d = engine.check("op.test", "u1");
        assert!(d.allowed);
        assert_eq!(d.remaining, Some(0));
    }

    #[test]
    fn test_unblock_restores_fresh_window() {
        let (engine, _clock) = test_engine();
        engine.check("op.test", "u1");
        engine.check("op.test", "u1");
        assert!(engine.check("op.test", "u1").blocked);

        engine.unblock("op.test", "u1");
        let d = engine.check("op.test", "u1");
        assert!(d.allowed);
        assert_eq!(d.remaining, Some(1));

        // Idempotent for keys never tracked.
        engine.unblock("op.test", "never-seen");
    }

    #[test]
    fn test_unknown_action_fails_open() {
        let (engine, _clock) = test_engine();
        let d = engine.check("nonexistent.action", "x");

        assert!(d.allowed);
        assert_eq!(d.remaining, None);
        assert!(!d.blocked);
        assert_eq!(engine.tracked_keys(), 0);
    }

    #[test]
    fn test_empty_action_fails_closed() {
        let (engine, _clock) = test_engine();
        let d = engine.check("", "u1");

        assert!(!d.allowed);
        assert!(d.error);
        assert!(!d.blocked);
        assert_eq!(d.reset_ms, 60_000);
        assert_eq!(engine.tracked_keys(), 0);

        let d = engine.check("op.test", "");
        assert!(!d.allowed);
        assert!(d.error);
    }

    #[test]
    fn test_identifiers_tracked_independently() {
        let (engine, _clock) = test_engine();
        engine.check("op.test", "u1");
        engine.check("op.test", "u1");
        assert!(engine.check("op.test", "u1").blocked);

        let d = engine.check("op.test", "u2");
        assert!(d.allowed);
        assert_eq!(d.remaining, Some(1));
    }

    #[test]
    fn test_anonymous_checks_share_the_global_key() {
        let (engine, _clock) = test_engine();
        engine.check_anonymous("op.test");
        engine.check_anonymous("op.test");
        assert!(engine.check_anonymous("op.test").blocked);
        assert!(engine.is_blocked("op.test", DEFAULT_IDENTIFIER));
    }

    #[test]
    fn test_admin_block_and_lazy_expiry() {
        let (engine, clock) = test_engine();
        engine.block("op.test", "u9", Duration::from_secs(30));

        assert!(engine.is_blocked("op.test", "u9"));
        let d = engine.check("op.test", "u9");
        assert!(!d.allowed);
        assert!(d.blocked);

        clock.set(30_000);
        assert!(!engine.is_blocked("op.test", "u9"));
        // The lapsed record was deleted on the way through.
        assert_eq!(engine.tracked_keys(), 0);
    }

    #[test]
    fn test_admin_block_overwrites() {
        let (engine, clock) = test_engine();
        engine.block("op.test", "u9", Duration::from_secs(60));
        engine.block("op.test", "u9", Duration::from_secs(5));

        clock.set(5_000);
        assert!(!engine.is_blocked("op.test", "u9"));
    }

    #[test]
    fn test_cleanup_evicts_only_expired_keys() {
        let (engine, clock) = test_engine();
        engine.check("op.test", "stale");
        engine.check("op.test", "banned");
        engine.check("op.test", "banned");
        assert!(engine.check("op.test", "banned").blocked); // until t=5000

        clock.set(1_800);
        engine.check("op.test", "fresh");

        clock.set(2_000);
        engine.cleanup();

        // "stale" aged out entirely; "banned" is held by its live block;
        // "fresh" still has a live attempt.
        assert_eq!(engine.tracked_keys(), 2);
        assert!(engine.is_blocked("op.test", "banned"));
        assert_eq!(engine.limit_info("op.test", "fresh").unwrap().requests, 1);
        assert!(!engine.all_limits()["op.test"].contains_key("stale"));

        clock.set(6_000);
        engine.cleanup();
        assert_eq!(engine.tracked_keys(), 0);
    }

    #[test]
    fn test_limit_info_is_read_only() {
        let (engine, _clock) = test_engine();
        assert!(engine.limit_info("nonexistent.action", "u1").is_none());

        let info = engine.limit_info("op.test", "u1").unwrap();
        assert_eq!(info.requests, 0);
        assert!(!info.blocked);
        assert_eq!(info.blocked_until_ms, None);
        assert_eq!(info.policy.max_attempts, 2);

        // Inspecting consumed nothing.
        let d = engine.check("op.test", "u1");
        assert_eq!(d.remaining, Some(1));
    }

    #[test]
    fn test_all_limits_snapshot() {
        let (engine, clock) = test_engine();
        engine.check("op.test", "u1");
        clock.set(100);
        engine.check("op.test", "u1");
        engine.check("op.other", "u2");

        let all = engine.all_limits();
        let snap = &all["op.test"]["u1"];
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.last_request_ms, Some(100));
        assert!(!snap.blocked);

        assert_eq!(all["op.other"]["u2"].requests, 1);
    }

    #[test]
    fn test_stats_aggregation() {
        let (engine, _clock) = test_engine();
        engine.check("op.test", "u1");
        engine.check("op.test", "u1");
        engine.check("op.test", "u2");
        engine.check("op.other", "u1");
        assert!(engine.check("op.test", "u1").blocked);

        let stats = engine.stats();
        assert_eq!(stats.tracked_keys, 3);
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.active_blocks, 1);

        let op = &stats.per_action["op.test"];
        assert_eq!(op.tracked_keys, 2);
        assert_eq!(op.requests, 3);
        assert_eq!(op.blocked_keys, 1);

        let other = &stats.per_action["op.other"];
        assert_eq!(other.tracked_keys, 1);
        assert_eq!(other.blocked_keys, 0);
    }

    #[test]
    fn test_headers_do_not_consume() {
        let (engine, _clock) = test_engine();
        for _ in 0..3 {
            let h = engine.headers("op.test", "u1").unwrap();
            assert_eq!(h.limit, 2);
            assert_eq!(h.remaining, 2);
            assert_eq!(h.window_secs, 1);
        }
        assert!(engine.headers("nonexistent.action", "u1").is_none());
    }

    #[test]
    fn test_headers_report_active_block() {
        let (engine, _clock) = test_engine();
        engine.check("op.test", "u1");
        engine.check("op.test", "u1");
        assert!(engine.check("op.test", "u1").blocked);

        let h = engine.headers("op.test", "u1").unwrap();
        assert_eq!(h.remaining, 0);
        assert_eq!(h.reset_secs, 5);
    }

    #[test]
    fn test_check_with_headers_consumes() {
        let (engine, _clock) = test_engine();
        let (d, h) = engine.check_with_headers("op.test", "u1");
        assert!(d.allowed);
        let h = h.unwrap();
        assert_eq!(h.limit, 2);
        assert_eq!(h.remaining, 1);

        let (d2, _) = engine.check_with_headers("op.test", "u1");
        assert_eq!(d2.remaining, Some(0));
    }

    #[test]
    fn test_from_config_uses_builtin_actions() {
        let engine = LimiterEngine::from_config(&PalisadeConfig::default());
        assert!(engine.policies().lookup("auth.login").is_some());
        assert!(engine.check("auth.login", "u1").allowed);
    }
}
