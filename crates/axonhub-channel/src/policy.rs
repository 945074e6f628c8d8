use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRule {
    pub status: u16,
    pub times: u32,
}

/// Disable a channel once a status has been seen `times` times in a row
/// (per channel; a success clears the slate).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDisablePolicy {
    #[serde(default)]
    pub statuses: Vec<StatusRule>,
}

impl AutoDisablePolicy {
    fn rule(&self, status: u16) -> Option<&StatusRule> {
        self.statuses.iter().find(|rule| rule.status == status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retryable_statuses: HashSet<u16>,
    pub first_token_deadline: Duration,
    pub per_attempt_deadline: Duration,
    pub overall_deadline: Duration,
    pub auto_disable: AutoDisablePolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retryable_statuses: [408, 429, 500, 502, 503, 504].into_iter().collect(),
            first_token_deadline: Duration::from_secs(30),
            per_attempt_deadline: Duration::from_secs(300),
            overall_deadline: Duration::from_secs(600),
            auto_disable: AutoDisablePolicy {
                statuses: vec![StatusRule {
                    status: 401,
                    times: 3,
                }],
            },
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableDecision {
    Keep,
    Disable { status: u16 },
}

/// Consecutive-failure counters, kept per (channel, status) and per
/// (channel, api key, status). Short-held mutexes; increment, test, clear.
#[derive(Debug, Default)]
pub struct ErrorCounters {
    by_channel: Mutex<HashMap<(i64, u16), u32>>,
    by_key: Mutex<HashMap<(i64, i64, u16), u32>>,
}

impl ErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_failure(
        &self,
        policy: &AutoDisablePolicy,
        channel_id: i64,
        api_key_id: Option<i64>,
        status: u16,
    ) -> DisableDecision {
        if let Some(api_key_id) = api_key_id {
            let mut keyed = self.by_key.lock().expect("error counter lock poisoned");
            *keyed.entry((channel_id, api_key_id, status)).or_insert(0) += 1;
        }

        let Some(rule) = policy.rule(status) else {
            return DisableDecision::Keep;
        };
        let mut counters = self.by_channel.lock().expect("error counter lock poisoned");
        let count = counters.entry((channel_id, status)).or_insert(0);
        *count += 1;
        if *count >= rule.times {
            counters.remove(&(channel_id, status));
            return DisableDecision::Disable { status };
        }
        DisableDecision::Keep
    }

    /// Any success for the channel resets every status counter for it.
    pub fn on_success(&self, channel_id: i64, api_key_id: Option<i64>) {
        self.by_channel
            .lock()
            .expect("error counter lock poisoned")
            .retain(|(id, _), _| *id != channel_id);
        if let Some(api_key_id) = api_key_id {
            self.by_key
                .lock()
                .expect("error counter lock poisoned")
                .retain(|(id, key, _), _| !(*id == channel_id && *key == api_key_id));
        }
    }

    pub fn key_failure_count(&self, channel_id: i64, api_key_id: i64, status: u16) -> u32 {
        self.by_key
            .lock()
            .expect("error counter lock poisoned")
            .get(&(channel_id, api_key_id, status))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AutoDisablePolicy {
        AutoDisablePolicy {
            statuses: vec![StatusRule {
                status: 401,
                times: 3,
            }],
        }
    }

    #[test]
    fn disables_after_threshold() {
        let counters = ErrorCounters::new();
        let policy = policy();
        assert_eq!(
            counters.on_failure(&policy, 7, None, 401),
            DisableDecision::Keep
        );
        assert_eq!(
            counters.on_failure(&policy, 7, None, 401),
            DisableDecision::Keep
        );
        assert_eq!(
            counters.on_failure(&policy, 7, None, 401),
            DisableDecision::Disable { status: 401 }
        );
    }

    #[test]
    fn success_resets_the_streak() {
        let counters = ErrorCounters::new();
        let policy = policy();
        counters.on_failure(&policy, 7, None, 401);
        counters.on_failure(&policy, 7, None, 401);
        counters.on_success(7, None);
        assert_eq!(
            counters.on_failure(&policy, 7, None, 401),
            DisableDecision::Keep
        );
    }

    #[test]
    fn unlisted_statuses_never_disable() {
        let counters = ErrorCounters::new();
        let policy = policy();
        for _ in 0..10 {
            assert_eq!(
                counters.on_failure(&policy, 7, None, 503),
                DisableDecision::Keep
            );
        }
    }

    #[test]
    fn keyed_counters_track_per_key() {
        let counters = ErrorCounters::new();
        let policy = policy();
        counters.on_failure(&policy, 7, Some(11), 401);
        counters.on_failure(&policy, 7, Some(11), 401);
        counters.on_failure(&policy, 7, Some(12), 401);
        assert_eq!(counters.key_failure_count(7, 11, 401), 2);
        assert_eq!(counters.key_failure_count(7, 12, 401), 1);
        counters.on_success(7, Some(11));
        assert_eq!(counters.key_failure_count(7, 11, 401), 0);
        assert_eq!(counters.key_failure_count(7, 12, 401), 1);
    }
}
