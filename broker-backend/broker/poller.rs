//! Supervisory polling of in-flight provisions.
//!
//! `provision` only starts a copy. One poller task per instance drives it to a
//! terminal state with a bounded retry budget; running out of attempts fails
//! the instance with a timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::error::BrokerError;
use super::instances::{InstanceLifecycleManager, ProvisionAttempt};
use super::{InstanceState, InstanceStatus};

/// Readiness-check schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Delay before the first check.
    pub interval: Duration,
    pub max_attempts: u32,
    /// Growth factor per attempt; 1.0 keeps a fixed interval.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 120,
            multiplier: 1.0,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl PollPolicy {
    /// Delay before check number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.interval.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            return self.max_interval.max(self.interval);
        }
        Duration::from_secs_f64(secs)
    }
}

pub struct ProvisionPoller {
    instances: Arc<InstanceLifecycleManager>,
    policy: PollPolicy,
}

impl ProvisionPoller {
    pub fn new(instances: Arc<InstanceLifecycleManager>, policy: PollPolicy) -> Self {
        Self { instances, policy }
    }

    /// Run `watch` in the background.
    pub fn spawn(self: &Arc<Self>, attempt: ProvisionAttempt) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let service_instance_id = &attempt.service_instance_id;
            match poller.watch(&attempt).await {
                Ok(Some(status)) => {
                    tracing::info!(
                        service_instance_id = %service_instance_id,
                        state = ?status.state,
                        "provision reached terminal state"
                    );
                }
                Ok(None) => {
                    tracing::info!(
                        service_instance_id = %service_instance_id,
                        copy_id = %attempt.copy_id,
                        "provision superseded by a newer attempt"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        service_instance_id = %service_instance_id,
                        error = %e,
                        "stopped polling provision"
                    );
                }
            }
        })
    }

    /// Poll until the attempt leaves `IN_PROGRESS` or the budget runs out.
    ///
    /// `Ok(None)` when the instance was re-provisioned under this poller.
    pub async fn watch(
        &self,
        attempt: &ProvisionAttempt,
    ) -> Result<Option<InstanceStatus>, BrokerError> {
        for n in 0..self.policy.max_attempts {
            tokio::time::sleep(self.policy.delay_for(n)).await;

            match self.instances.poll_attempt(attempt).await {
                Ok(None) => return Ok(None),
                Ok(Some(status)) if status.state != InstanceState::InProgress => {
                    return Ok(Some(status));
                }
                Ok(Some(_)) => {}
                Err(e @ (BrokerError::NotFound { .. } | BrokerError::Gone(_))) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        service_instance_id = %attempt.service_instance_id,
                        attempt = n,
                        error = %e,
                        "readiness check failed, will retry"
                    );
                }
            }
        }

        self.instances
            .mark_timed_out(attempt, self.policy.max_attempts)
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::action_log::ActionLog;
    use crate::copy::simulated::SimulatedCopyProvider;
    use crate::store::Stores;

    fn fast(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts,
            multiplier: 1.0,
            max_interval: Duration::from_millis(5),
        }
    }

    fn manager(provider: Arc<SimulatedCopyProvider>) -> Arc<InstanceLifecycleManager> {
        let stores = Stores::in_memory();
        Arc::new(InstanceLifecycleManager::new(
            stores.instances.clone(),
            stores.bindings.clone(),
            provider,
            ActionLog::new(stores.actions.clone()),
        ))
    }

    async fn started(instances: &InstanceLifecycleManager, id: &str) -> ProvisionAttempt {
        let instance = instances.provision(id, "src-A").await.unwrap();
        ProvisionAttempt::of(&instance).unwrap()
    }

    #[test]
    fn fixed_interval_by_default() {
        let policy = PollPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for(50), Duration::from_secs(3));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = PollPolicy {
            interval: Duration::from_secs(1),
            max_attempts: 10,
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn watch_returns_when_copy_is_ready() {
        let provider = Arc::new(SimulatedCopyProvider::new(3));
        let instances = manager(provider);
        let attempt = started(&instances, "svc-1").await;

        let poller = ProvisionPoller::new(instances.clone(), fast(10));
        let status = poller.watch(&attempt).await.unwrap().unwrap();
        assert_eq!(status.state, InstanceState::Succeeded);
    }

    #[tokio::test]
    async fn exhausted_budget_times_out() {
        let provider = Arc::new(SimulatedCopyProvider::new(100));
        let instances = manager(provider);
        let attempt = started(&instances, "svc-1").await;

        let poller = ProvisionPoller::new(instances.clone(), fast(4));
        let err = poller.watch(&attempt).await.unwrap_err();
        assert!(matches!(err, BrokerError::TimedOut { attempts: 4, .. }));

        let status = instances.status("svc-1").await.unwrap();
        assert_eq!(status.state, InstanceState::Failed);
        assert!(status.message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn spawned_poller_completes_in_background() {
        let provider = Arc::new(SimulatedCopyProvider::new(2));
        let instances = manager(provider);
        let attempt = started(&instances, "svc-1").await;

        let poller = Arc::new(ProvisionPoller::new(instances.clone(), fast(10)));
        poller.spawn(attempt).await.unwrap();
        assert_eq!(
            instances.status("svc-1").await.unwrap().state,
            InstanceState::Succeeded
        );
    }

    #[tokio::test]
    async fn old_poller_leaves_reprovisioned_instance_alone() {
        let provider = Arc::new(SimulatedCopyProvider::new(1000));
        let instances = manager(provider.clone());

        let first = started(&instances, "svc-1").await;
        provider.fail_copy(&first.copy_id, "disk error").await;
        instances.poll_status("svc-1").await.unwrap();
        let second = started(&instances, "svc-1").await;

        // The first attempt's poller has a budget of one check left.
        let stale = ProvisionPoller::new(instances.clone(), fast(1));
        assert_eq!(stale.watch(&first).await.unwrap(), None);

        let status = instances.status("svc-1").await.unwrap();
        assert_eq!(status.state, InstanceState::InProgress);
        assert_eq!(provider.checks(&second.copy_id).await, 0);

        let current = ProvisionPoller::new(instances.clone(), fast(3));
        let err = current.watch(&second).await.unwrap_err();
        assert!(matches!(err, BrokerError::TimedOut { attempts: 3, .. }));
        assert_eq!(provider.checks(&second.copy_id).await, 3);
    }
}
