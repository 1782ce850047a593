use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::models::retry::millis;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    #[serde(rename = "cool_down_ms", with = "millis")]
    pub cool_down: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cool_down: Duration::from_secs(30),
        }
    }
}

/// Counts consecutive dispatch failures of one backend and keeps it
/// unavailable for a cool-down window once the threshold is reached.
#[derive(Debug)]
pub struct HealthTracker {
    policy: HealthPolicy,
    state: Mutex<HealthState>,
}

#[derive(Debug, Default)]
struct HealthState {
    consecutive_failures: u32,
    unavailable_until: Option<Instant>,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(HealthState::default()),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
    }

    /// Returns true when this failure tripped the backend into cool-down.
    pub fn record_failure(&self) -> bool {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.policy.failure_threshold.max(1) {
            state.consecutive_failures = 0;
            state.unavailable_until = Some(Instant::now() + self.policy.cool_down);
            return true;
        }
        false
    }

    /// Marks the backend unavailable for one cool-down window, e.g. after an
    /// explicit unhealthy report.
    pub fn mark_unhealthy(&self) {
        let mut state = self.lock();
        state.unavailable_until = Some(Instant::now() + self.policy.cool_down);
    }

    /// `Some(deadline)` on the tokio clock while the backend is cooling down.
    pub fn unavailable_until(&self) -> Option<Instant> {
        let mut state = self.lock();
        match state.unavailable_until {
            Some(until) if until > Instant::now() => Some(until),
            Some(_) => {
                state.unavailable_until = None;
                None
            }
            None => None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.unavailable_until().is_none()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{HealthPolicy, HealthTracker};

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let tracker = HealthTracker::new(HealthPolicy {
            failure_threshold: 2,
            cool_down: Duration::from_secs(60),
        });

        assert!(!tracker.record_failure());
        tracker.record_success();
        assert!(!tracker.record_failure());
        assert!(tracker.is_available());
        assert!(tracker.record_failure());
        assert!(!tracker.is_available());
    }

    #[test]
    fn cool_down_expires() {
        let tracker = HealthTracker::new(HealthPolicy {
            failure_threshold: 1,
            cool_down: Duration::from_millis(5),
        });
        tracker.mark_unhealthy();
        assert!(!tracker.is_available());
        std::thread::sleep(Duration::from_millis(15));
        assert!(tracker.is_available());
    }

    #[tokio::test]
    async fn cool_down_deadline_can_be_slept_until() {
        let tracker = HealthTracker::new(HealthPolicy {
            failure_threshold: 1,
            cool_down: Duration::from_millis(20),
        });
        tracker.mark_unhealthy();
        let until = tracker.unavailable_until().unwrap();
        assert!(until <= tokio::time::Instant::now() + Duration::from_millis(20));

        tokio::time::sleep_until(until).await;
        assert!(tracker.is_available());
    }
}
