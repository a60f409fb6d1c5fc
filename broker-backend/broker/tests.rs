//! End-to-end lifecycle scenarios through the public services.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use super::error::BrokerError;
use super::poller::PollPolicy;
use super::service::{BindOutcome, Broker};
use super::{BrokerActionState, InstanceState, ServiceInstanceBinding};
use crate::copy::provider::CopyProvider;
use crate::copy::simulated::SimulatedCopyProvider;
use crate::store::Stores;
use crate::store::repository::Repository;

/// Background pollers never fire during a test; tests poll by hand.
fn idle_policy() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_secs(3600),
        max_attempts: 1,
        multiplier: 1.0,
        max_interval: Duration::from_secs(3600),
    }
}

fn broker(ready_after: u32) -> (Broker, Arc<SimulatedCopyProvider>, Stores) {
    let stores = Stores::in_memory();
    let provider = Arc::new(SimulatedCopyProvider::new(ready_after));
    let broker = Broker::new(&stores, provider.clone(), idle_policy());
    (broker, provider, stores)
}

async fn poll_until_settled(broker: &Broker, id: &str) -> InstanceState {
    for _ in 0..20 {
        let status = broker.provisioning.last_operation(id).await.unwrap();
        if status.state != InstanceState::InProgress {
            return status.state;
        }
    }
    InstanceState::InProgress
}

#[tokio::test]
async fn full_lifecycle_provision_bind_unbind_deprovision() {
    let (broker, provider, stores) = broker(2);

    let instance = broker.provisioning.provision("svc-1", "src-A").await.unwrap();
    assert_eq!(instance.state, InstanceState::InProgress);
    let copy_id = instance.copy_id.unwrap();

    assert_eq!(poll_until_settled(&broker, "svc-1").await, InstanceState::Succeeded);

    let outcome = broker.binding.bind("bind-1", "svc-1", "app-X").await.unwrap();
    let BindOutcome::Created(binding) = outcome else {
        panic!("expected a new binding");
    };
    assert_eq!(binding.credentials, provider.get_creds(&copy_id).await.unwrap());

    broker.binding.unbind("bind-1").await.unwrap();
    assert!(broker.binding.binding("bind-1").await.unwrap().is_none());

    broker.provisioning.deprovision("svc-1").await.unwrap();
    assert!(matches!(
        broker.provisioning.last_operation("svc-1").await,
        Err(BrokerError::Gone(_))
    ));
    assert!(matches!(
        broker.provisioning.last_operation("svc-never").await,
        Err(BrokerError::NotFound { .. })
    ));

    let trail = stores.actions.find_by_id("svc-1").await.unwrap();
    assert_eq!(trail.first().unwrap().state, BrokerActionState::InProgress);
    assert_eq!(trail.last().unwrap().state, BrokerActionState::Complete);
    assert_eq!(trail.last().unwrap().message, "Deprovisioned copy");
}

#[tokio::test]
async fn bind_before_provision_completes_is_not_ready() {
    let (broker, _, _) = broker(5);
    broker.provisioning.provision("svc-2", "src-A").await.unwrap();

    let err = broker.binding.bind("bind-2", "svc-2", "app-X").await.unwrap_err();
    assert!(matches!(err, BrokerError::InstanceNotReady { .. }));
    assert!(broker.binding.bindings().await.unwrap().is_empty());
}

#[tokio::test]
async fn deprovision_with_live_binding_conflicts() {
    let (broker, provider, _) = broker(0);
    broker.provisioning.provision("svc-3", "src-A").await.unwrap();
    poll_until_settled(&broker, "svc-3").await;
    broker.binding.bind("bind-3", "svc-3", "app-X").await.unwrap();

    let err = broker.provisioning.deprovision("svc-3").await.unwrap_err();
    assert!(matches!(err, BrokerError::Conflict(_)));

    let instance = broker.provisioning.instance("svc-3").await.unwrap().unwrap();
    assert_eq!(instance.state, InstanceState::Succeeded);
    assert!(provider.deleted().await.is_empty());
}

#[tokio::test]
async fn identical_bind_retry_returns_existing_binding() {
    let (broker, _, _) = broker(0);
    broker.provisioning.provision("svc-1", "src-A").await.unwrap();
    poll_until_settled(&broker, "svc-1").await;

    let first = broker.binding.bind("bind-1", "svc-1", "app-X").await.unwrap();
    let retry = broker.binding.bind("bind-1", "svc-1", "app-X").await.unwrap();
    assert!(matches!(retry, BindOutcome::Existing(_)));
    assert_eq!(retry.binding(), first.binding());

    let err = broker.binding.bind("bind-1", "svc-1", "app-Y").await.unwrap_err();
    assert!(matches!(err, BrokerError::DuplicateBinding(_)));
    assert_eq!(broker.binding.bindings().await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_provisions_of_one_id_accept_exactly_one() {
    let (broker, _, _) = broker(5);

    let attempts = (0..6).map(|_| {
        let broker = broker.clone();
        async move { broker.provisioning.provision("svc-1", "src-A").await }
    });
    let results = futures::future::join_all(attempts).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, BrokerError::AlreadyExists(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deprovision_and_bind_never_both_succeed() {
    let (broker, _, _) = broker(0);

    for round in 0..20 {
        let id = format!("svc-{round}");
        broker.provisioning.provision(&id, "src-A").await.unwrap();
        assert_eq!(poll_until_settled(&broker, &id).await, InstanceState::Succeeded);

        let teardown = {
            let broker = broker.clone();
            let id = id.clone();
            tokio::spawn(async move { broker.provisioning.deprovision(&id).await })
        };
        let bind = {
            let broker = broker.clone();
            let id = id.clone();
            tokio::spawn(async move {
                broker
                    .binding
                    .bind(&format!("bind-{id}"), &id, "app-X")
                    .await
            })
        };
        let (teardown, bind) = (teardown.await.unwrap(), bind.await.unwrap());

        match (teardown, bind) {
            (Err(BrokerError::Conflict(_)), Ok(BindOutcome::Created(_))) => {
                let instance = broker.provisioning.instance(&id).await.unwrap().unwrap();
                assert_eq!(instance.state, InstanceState::Succeeded);
            }
            (Ok(gone), Err(BrokerError::Gone(_))) => {
                assert_eq!(gone.state, InstanceState::Gone);
                assert!(broker.binding.binding(&format!("bind-{id}")).await.unwrap().is_none());
            }
            (teardown, bind) => panic!("round {round}: interleaved outcome {teardown:?} / {bind:?}"),
        }
    }

    // No binding survives on a torn-down instance.
    for binding in broker.binding.bindings().await.unwrap() {
        let instance = broker
            .provisioning
            .instance(&binding.service_instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(instance.state, InstanceState::Gone);
    }
}

#[tokio::test]
async fn pairs_report_sources_and_apps() {
    let (broker, _, _) = broker(0);
    let copy_id = broker
        .provisioning
        .provision("svc-1", "src-A")
        .await
        .unwrap()
        .copy_id
        .unwrap();
    poll_until_settled(&broker, "svc-1").await;
    broker.binding.bind("bind-1", "svc-1", "app-X").await.unwrap();

    let instances = broker.provisioning.instance_pairs().await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].source, "src-A");
    assert_eq!(instances[0].copy, copy_id);

    let bindings = broker.binding.binding_pairs().await.unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].source, "app-X");
    assert_eq!(bindings[0].copy, copy_id);
}

#[tokio::test]
async fn restart_resumes_polling_from_file_store() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(SimulatedCopyProvider::new(1));

    {
        let stores = Stores::open(tmp.path()).await.unwrap();
        let broker = Broker::new(&stores, provider.clone(), idle_policy());
        broker.provisioning.provision("svc-1", "src-A").await.unwrap();
    }

    let stores = Stores::open(tmp.path()).await.unwrap();
    let fast = PollPolicy {
        interval: Duration::from_millis(1),
        max_attempts: 50,
        multiplier: 1.0,
        max_interval: Duration::from_millis(5),
    };
    let broker = Broker::new(&stores, provider, fast);
    assert_eq!(broker.provisioning.resume_pending().await.unwrap(), 1);

    let mut state = InstanceState::InProgress;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        state = broker
            .provisioning
            .instance("svc-1")
            .await
            .unwrap()
            .unwrap()
            .state;
        if state != InstanceState::InProgress {
            break;
        }
    }
    assert_eq!(state, InstanceState::Succeeded);
}

/// Binding store whose writes always fail.
struct BrokenBindingStore;

#[async_trait]
impl Repository<ServiceInstanceBinding> for BrokenBindingStore {
    async fn save(&self, _entity: ServiceInstanceBinding) -> Result<()> {
        bail!("disk full")
    }
    async fn find_by_id(&self, _id: &str) -> Result<Option<ServiceInstanceBinding>> {
        Ok(None)
    }
    async fn find_all(&self) -> Result<Vec<ServiceInstanceBinding>> {
        Ok(Vec::new())
    }
    async fn delete(&self, _id: &str) -> Result<bool> {
        bail!("disk full")
    }
    async fn load_all(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn storage_failure_during_bind_is_logged_and_returned() {
    let mut stores = Stores::in_memory();
    stores.bindings = Arc::new(BrokenBindingStore);
    let provider = Arc::new(SimulatedCopyProvider::new(0));
    let broker = Broker::new(&stores, provider, idle_policy());

    broker.provisioning.provision("svc-1", "src-A").await.unwrap();
    poll_until_settled(&broker, "svc-1").await;

    let err = broker.binding.bind("bind-1", "svc-1", "app-X").await.unwrap_err();
    assert!(matches!(err, BrokerError::Storage(ref m) if m.contains("disk full")));

    let latest = broker.actions.latest("bind-1").await.unwrap().unwrap();
    assert_eq!(latest.state, BrokerActionState::Failed);
}
