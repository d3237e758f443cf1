//! Per-endpoint admission control.
//!
//! Every endpoint response outcome is appended to a rolling window per
//! endpoint; an endpoint stops being admissible once its live error
//! ratio crosses the configured threshold. This is a leaky-bucket
//! circuit breaker: there is no open/closed state machine, admissibility
//! is recomputed from the window on every call, and enough successes
//! (or an idle TTL expiry) restore admission.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use url::Url;

use crate::config::RetryBudgetConfig;

/// Outcome of one endpoint sub-request attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

struct EndpointWindow {
    outcomes: VecDeque<bool>,
    errors: usize,
    touched: Instant,
}

impl EndpointWindow {
    fn new() -> Self {
        Self {
            outcomes: VecDeque::new(),
            errors: 0,
            touched: Instant::now(),
        }
    }

    fn record(&mut self, is_error: bool, capacity: usize) {
        while self.outcomes.len() >= capacity {
            if self.outcomes.pop_front() == Some(true) {
                self.errors -= 1;
            }
        }
        self.outcomes.push_back(is_error);
        if is_error {
            self.errors += 1;
        }
        self.touched = Instant::now();
    }

    /// Error ratio in percent over the live window.
    fn error_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.errors as f64 / self.outcomes.len() as f64 * 100.0
    }
}

/// Process-wide tracker shared by all concurrent requests. Internally
/// synchronized; the lock is never held across an await point.
pub struct RetryBudget {
    config: RetryBudgetConfig,
    ttl: Duration,
    entries: Mutex<HashMap<String, EndpointWindow>>,
}

impl RetryBudget {
    pub fn new(config: RetryBudgetConfig) -> Self {
        let ttl = Duration::from_secs(config.ttl_secs);
        Self {
            config,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Endpoint identity: network location plus path, so that distinct
    /// services on one host are tracked separately.
    fn key(url: &Url) -> String {
        format!("{}{}", url.authority(), url.path())
    }

    /// Append an outcome to the endpoint's window, evicting the oldest
    /// entry when the window is full, and refresh the entry's TTL.
    pub fn record(&self, url: &Url, outcome: Outcome) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(Self::key(url))
            .or_insert_with(EndpointWindow::new);

        if entry.touched.elapsed() >= self.ttl {
            *entry = EndpointWindow::new();
        }
        entry.record(outcome == Outcome::Error, self.config.window_size);
    }

    /// Whether requests to this endpoint are currently admitted.
    ///
    /// Admission is granted until the sample count reaches the
    /// configured minimum; after that it is denied while the error ratio
    /// sits at or above the threshold. Idle entries expire and reset.
    pub fn is_admissible(&self, url: &Url) -> bool {
        let key = Self::key(url);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let expired = match entries.get(&key) {
            None => return true,
            Some(entry) => entry.touched.elapsed() >= self.ttl,
        };
        if expired {
            entries.remove(&key);
            return true;
        }

        let entry = &entries[&key];
        entry.outcomes.len() < self.config.min_samples
            || entry.error_ratio() < self.config.threshold_percent
    }

    /// Error ratio in percent for an endpoint, 0.0 when untracked.
    pub fn error_ratio(&self, url: &Url) -> f64 {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&Self::key(url))
            .map(EndpointWindow::error_ratio)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(window_size: usize, min_samples: usize, ttl_secs: u64) -> RetryBudget {
        RetryBudget::new(RetryBudgetConfig {
            threshold_percent: 1.0,
            ttl_secs,
            window_size,
            min_samples,
        })
    }

    fn url(path: &str) -> Url {
        Url::parse(&format!("http://archive.example.org{path}")).unwrap()
    }

    #[test]
    fn test_admissible_until_min_samples() {
        let budget = budget(100, 100, 3600);
        let url = url("/fdsnws/dataselect/1/query");

        // All errors, but below the minimum sample size
        for _ in 0..99 {
            budget.record(&url, Outcome::Error);
        }
        assert!(budget.is_admissible(&url));

        budget.record(&url, Outcome::Error);
        assert!(!budget.is_admissible(&url));
    }

    #[test]
    fn test_threshold_flip_and_recovery_via_eviction() {
        let budget = budget(100, 100, 3600);
        let url = url("/fdsnws/dataselect/1/query");

        // 98 successes and 2 errors: ratio 2% >= 1% at full sample size
        for _ in 0..98 {
            budget.record(&url, Outcome::Success);
        }
        for _ in 0..2 {
            budget.record(&url, Outcome::Error);
        }
        assert!(!budget.is_admissible(&url));
        assert_eq!(budget.error_ratio(&url), 2.0);

        // 100 further successes evict the old errors from the ring
        for _ in 0..100 {
            budget.record(&url, Outcome::Success);
        }
        assert!(budget.is_admissible(&url));
        assert_eq!(budget.error_ratio(&url), 0.0);
    }

    #[test]
    fn test_idle_entries_expire() {
        let budget = budget(10, 1, 0);
        let url = url("/fdsnws/dataselect/1/query");

        budget.record(&url, Outcome::Error);
        // TTL of zero: the entry is already stale on the next check
        assert!(budget.is_admissible(&url));
    }

    #[test]
    fn test_endpoints_tracked_independently() {
        let budget = budget(10, 1, 3600);
        let dataselect = url("/fdsnws/dataselect/1/query");
        let station = url("/fdsnws/station/1/query");

        budget.record(&dataselect, Outcome::Error);
        assert!(!budget.is_admissible(&dataselect));
        assert!(budget.is_admissible(&station));
    }
}
