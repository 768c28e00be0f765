use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::{debug, info};

use crate::{
    account::AccountId,
    config::InstanceId,
    error::{LaunchError, StoreError},
    java::JavaRuntime,
    launch::PreparedRuntime,
    net::PortMappingClient,
    process::ProcessSpawner,
    session::{
        SessionInfo,
        supervisor::{LaunchSpec, LaunchSupervisor},
    },
    store::{AccountStore, InstanceStore},
};

enum Slot {
    /// Launch in flight; blocks duplicates while credential resolution and
    /// spawning run.
    Reserved,
    Active(Arc<LaunchSupervisor>),
}

type SessionMap = Arc<Mutex<HashMap<InstanceId, Slot>>>;

/// Process-wide map of instance id to active session. Enforces at most one
/// non-stopped session per instance and routes cancellation by id.
///
/// The map mutex is held only for lookup/insert/remove, never across an
/// await, so unrelated instances never serialize each other.
pub struct SupervisorRegistry {
    sessions: SessionMap,
    instances: Arc<dyn InstanceStore>,
    accounts: Arc<dyn AccountStore>,
    spawner: Arc<dyn ProcessSpawner>,
    mapping_client: Arc<dyn PortMappingClient>,
    grace: Duration,
}

impl SupervisorRegistry {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        accounts: Arc<dyn AccountStore>,
        spawner: Arc<dyn ProcessSpawner>,
        mapping_client: Arc<dyn PortMappingClient>,
    ) -> Self {
        Self::with_grace(
            instances,
            accounts,
            spawner,
            mapping_client,
            LaunchSupervisor::DEFAULT_GRACE,
        )
    }

    pub fn with_grace(
        instances: Arc<dyn InstanceStore>,
        accounts: Arc<dyn AccountStore>,
        spawner: Arc<dyn ProcessSpawner>,
        mapping_client: Arc<dyn PortMappingClient>,
        grace: Duration,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            instances,
            accounts,
            spawner,
            mapping_client,
            grace,
        }
    }

    /// Launches a session for `instance_id`. Fails fast with
    /// [`LaunchError::AlreadyRunning`] while another session for the same
    /// instance is live; never queues.
    pub async fn launch(
        &self,
        instance_id: InstanceId,
        account_id: AccountId,
        java: JavaRuntime,
        prepared: PreparedRuntime,
    ) -> Result<Arc<LaunchSupervisor>, LaunchError> {
        {
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(&instance_id) {
                return Err(LaunchError::AlreadyRunning);
            }
            sessions.insert(instance_id, Slot::Reserved);
        }

        match self
            .resolve_and_launch(instance_id, account_id, java, prepared)
            .await
        {
            Ok(supervisor) => {
                self.register_active(instance_id, &supervisor);
                Ok(supervisor)
            }
            Err(e) => {
                self.sessions.lock().unwrap().remove(&instance_id);
                Err(e)
            }
        }
    }

    /// Upgrades the launch reservation to an active slot. A session that
    /// exits fast enough can finish teardown and deregister itself before
    /// the launching task gets here; the vacated slot must stay vacated or
    /// the instance would read as running forever.
    fn register_active(&self, instance_id: InstanceId, supervisor: &Arc<LaunchSupervisor>) {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.entry(instance_id) {
            Entry::Occupied(mut slot) => {
                slot.insert(Slot::Active(supervisor.clone()));
                info!(instance = %instance_id, "session registered");
            }
            Entry::Vacant(_) => {
                debug!(instance = %instance_id, "session stopped before registration");
            }
        }
    }

    async fn resolve_and_launch(
        &self,
        instance_id: InstanceId,
        account_id: AccountId,
        java: JavaRuntime,
        prepared: PreparedRuntime,
    ) -> Result<Arc<LaunchSupervisor>, LaunchError> {
        let config = self.instances.get(instance_id).await.map_err(|e| match e {
            StoreError::NotFound => LaunchError::InstanceNotFound,
            StoreError::Backend(msg) => LaunchError::Store(msg),
        })?;

        let credential = self
            .accounts
            .resolve_credential(account_id)
            .await
            .map_err(|e| LaunchError::Auth(e.to_string()))?;

        let sessions = self.sessions.clone();
        let on_stopped: Box<dyn FnOnce(InstanceId) + Send> = Box::new(move |id: InstanceId| {
            sessions.lock().unwrap().remove(&id);
            debug!(instance = %id, "session deregistered");
        });

        LaunchSupervisor::launch(
            LaunchSpec {
                config,
                account_id,
                credential,
                java,
                prepared,
            },
            self.spawner.as_ref(),
            self.mapping_client.clone(),
            self.instances.clone(),
            self.grace,
            Some(on_stopped),
        )
    }

    pub fn get(&self, instance_id: InstanceId) -> Option<Arc<LaunchSupervisor>> {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(&instance_id) {
            Some(Slot::Active(supervisor)) => Some(supervisor.clone()),
            _ => None,
        }
    }

    /// Requests teardown of the session for `instance_id`. Returns false if
    /// no session is live.
    pub fn cancel(&self, instance_id: InstanceId) -> bool {
        match self.get(instance_id) {
            Some(supervisor) => {
                supervisor.cancel();
                true
            }
            None => false,
        }
    }

    fn active(&self) -> Vec<Arc<LaunchSupervisor>> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(s) => Some(s.clone()),
                Slot::Reserved => None,
            })
            .collect()
    }

    /// Snapshot of every live session, for listings.
    pub async fn running(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for supervisor in self.active() {
            infos.push(supervisor.info().await);
        }
        infos
    }

    /// Cancels every live session and waits for each to finish teardown.
    /// No port lease outlives this call.
    pub async fn shutdown(&self) {
        let active = self.active();
        for supervisor in &active {
            supervisor.cancel();
        }
        for supervisor in active {
            supervisor.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::supervisor::doubles::*;
    use crate::session::{SessionState, StopReason};

    fn java() -> JavaRuntime {
        test_spec(test_config(None)).java
    }

    fn prepared() -> PreparedRuntime {
        test_spec(test_config(None)).prepared
    }

    struct Harness {
        registry: SupervisorRegistry,
        process: Arc<FakeProcess>,
        store: Arc<RecordingStore>,
        client: Arc<CountingClient>,
        instance_id: InstanceId,
        account_id: AccountId,
    }

    fn harness() -> Harness {
        let config = test_config(None);
        let instance_id = config.id;
        let process = FakeProcess::pending(true);
        let store = RecordingStore::with(config);
        let client = CountingClient::ok();
        let accounts = FakeAccounts;
        let registry = SupervisorRegistry::new(
            store.clone(),
            Arc::new(accounts),
            Arc::new(FakeSpawner::new(process.clone())),
            client.clone(),
        );
        Harness {
            registry,
            process,
            store,
            client,
            instance_id,
            account_id: AccountId::new(),
        }
    }

    struct FakeAccounts;

    #[async_trait::async_trait]
    impl AccountStore for FakeAccounts {
        async fn resolve_credential(
            &self,
            _id: AccountId,
        ) -> Result<crate::account::Credential, crate::error::StoreError> {
            Ok(crate::account::Credential::offline(
                uuid::Uuid::nil(),
                "steve",
            ))
        }
    }

    #[tokio::test]
    async fn second_launch_for_same_instance_fails_fast() {
        let h = harness();
        let first = h
            .registry
            .launch(h.instance_id, h.account_id, java(), prepared())
            .await
            .unwrap();

        let err = h
            .registry
            .launch(h.instance_id, h.account_id, java(), prepared())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::AlreadyRunning));

        // The existing session was untouched by the rejected attempt.
        assert_ne!(first.state().await, SessionState::Stopped(StopReason::Exited));
        assert_eq!(h.store.writes.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn stopped_session_frees_the_instance_for_relaunch() {
        let h = harness();
        let supervisor = h
            .registry
            .launch(h.instance_id, h.account_id, java(), prepared())
            .await
            .unwrap();

        h.process.exit_with(0);
        supervisor.wait().await;
        // Deregistration runs in the watcher; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(h.registry.get(h.instance_id).is_none());

        let relaunch = h
            .registry
            .launch(h.instance_id, h.account_id, java(), prepared())
            .await;
        assert!(relaunch.is_ok());
    }

    #[tokio::test]
    async fn fast_exit_before_registration_does_not_wedge_the_instance() {
        let h = harness();
        h.registry
            .sessions
            .lock()
            .unwrap()
            .insert(h.instance_id, Slot::Reserved);
        let supervisor = h
            .registry
            .resolve_and_launch(h.instance_id, h.account_id, java(), prepared())
            .await
            .unwrap();

        // The process exits and the watcher deregisters the reservation
        // before the launching task upgrades it.
        h.process.exit_with(0);
        supervisor.wait().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(h.registry.sessions.lock().unwrap().is_empty());

        h.registry.register_active(h.instance_id, &supervisor);
        assert!(h.registry.get(h.instance_id).is_none());
        assert!(h.registry.sessions.lock().unwrap().is_empty());

        // The instance stays free for a relaunch.
        let relaunch = h
            .registry
            .launch(h.instance_id, h.account_id, java(), prepared())
            .await;
        assert!(relaunch.is_ok());
    }

    #[tokio::test]
    async fn unknown_instance_is_rejected_and_not_reserved() {
        let h = harness();
        let missing = InstanceId::new();
        let err = h
            .registry
            .launch(missing, h.account_id, java(), prepared())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::InstanceNotFound));

        // Failed launch releases the reservation.
        assert!(h.registry.sessions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_by_id_reaches_the_session() {
        let h = harness();
        let supervisor = h
            .registry
            .launch(h.instance_id, h.account_id, java(), prepared())
            .await
            .unwrap();

        assert!(h.registry.cancel(h.instance_id));
        assert_eq!(supervisor.wait().await, StopReason::Cancelled);
        assert!(!h.registry.cancel(InstanceId::new()));
    }

    #[tokio::test]
    async fn running_lists_live_sessions() {
        let h = harness();
        h.registry
            .launch(h.instance_id, h.account_id, java(), prepared())
            .await
            .unwrap();

        let running = h.registry.running().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].instance_id, h.instance_id);
        assert_eq!(running[0].pid, Some(4242));
    }

    #[tokio::test]
    async fn shutdown_tears_every_session_down() {
        let h = harness();
        h.registry
            .launch(h.instance_id, h.account_id, java(), prepared())
            .await
            .unwrap();

        h.registry.shutdown().await;
        let running = h.registry.running().await;
        assert!(running.iter().all(|info| info.state.is_stopped()));
        let _ = h.client;
    }
}
