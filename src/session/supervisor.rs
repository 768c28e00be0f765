use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{RwLock, broadcast, watch},
    time::{Instant, timeout},
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    account::{AccountId, Credential},
    config::{InstanceConfig, InstanceId},
    error::LaunchError,
    java::JavaRuntime,
    launch::{LAUNCHER_BRAND, PreparedRuntime, build_arguments},
    net::{MappingRequest, PortMappingClient, exposure::NetworkExposureManager},
    process::{ProcessExit, ProcessHandle, ProcessSpawner},
    session::{
        SessionInfo, SessionState, StopReason,
        event::LifecycleEvent,
    },
};

/// Everything a launch needs, resolved up front by the stores and the
/// content collaborator.
pub struct LaunchSpec {
    pub config: InstanceConfig,
    pub account_id: AccountId,
    pub credential: Credential,
    pub java: JavaRuntime,
    pub prepared: PreparedRuntime,
}

type StoppedCallback = Box<dyn FnOnce(InstanceId) + Send + 'static>;

/// Supervises one running game session: owns the process handle, the
/// playtime clock, and the exposure manager, and drives the
/// `Starting → Running → Stopping → Stopped` state machine to completion.
///
/// Spawning happens inside [`LaunchSupervisor::launch`]; configuration and
/// spawn failures surface there synchronously. Everything after that runs in
/// the supervisor's own tasks and is reported through lifecycle events and
/// [`LaunchSupervisor::wait`].
pub struct LaunchSupervisor {
    instance_id: InstanceId,
    account_id: AccountId,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<LifecycleEvent>,
    process: Arc<dyn ProcessHandle>,
    exposure: Arc<NetworkExposureManager>,
    mapping_request: Option<MappingRequest>,
    cancel: CancellationToken,
    teardown: CancellationToken,
    finished_rx: watch::Receiver<Option<StopReason>>,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl std::fmt::Debug for LaunchSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSupervisor")
            .field("instance_id", &self.instance_id)
            .field("account_id", &self.account_id)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl LaunchSupervisor {
    pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

    /// Builds the argument list, spawns the process, and starts the
    /// supervision tasks. Returns as soon as the process is confirmed
    /// started; port mapping proceeds asynchronously and never blocks this.
    ///
    /// `on_stopped` fires exactly once, after the session has reached
    /// `Stopped` with all mappings released and playtime persisted.
    pub fn launch(
        spec: LaunchSpec,
        spawner: &dyn ProcessSpawner,
        mapping_client: Arc<dyn PortMappingClient>,
        store: Arc<dyn crate::store::InstanceStore>,
        grace: Duration,
        on_stopped: Option<StoppedCallback>,
    ) -> Result<Arc<Self>, LaunchError> {
        let config = spec.config.validated()?;
        let args = build_arguments(&config, &spec.java, &spec.prepared, &spec.credential)?;
        let process = spawner.spawn(&spec.java.path, &args, &spec.prepared.instance_dir)?;

        let mapping_request = config.hosting.map(|h| MappingRequest {
            external_port: h.port,
            internal_port: h.port,
            protocol: h.protocol,
            lease_secs: h.lease_secs,
            description: format!("{} {}", LAUNCHER_BRAND, config.name),
        });

        let (finished_tx, finished_rx) = watch::channel(None);
        let supervisor = Arc::new(Self {
            instance_id: config.id,
            account_id: spec.account_id,
            state: Arc::new(RwLock::new(SessionState::Starting)),
            events: broadcast::Sender::new(256),
            process,
            exposure: Arc::new(NetworkExposureManager::new(mapping_client)),
            mapping_request,
            cancel: CancellationToken::new(),
            teardown: CancellationToken::new(),
            finished_rx,
            started_at: Utc::now(),
            started: Instant::now(),
        });

        supervisor.spawn_watcher(store, grace, finished_tx, on_stopped);
        Ok(supervisor)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            instance_id: self.instance_id,
            account_id: self.account_id,
            pid: self.process.pid(),
            started_at: self.started_at,
            state: self.state().await,
        }
    }

    pub fn subscribe(&self) -> BroadcastStream<LifecycleEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub fn exposure(&self) -> &NetworkExposureManager {
        &self.exposure
    }

    /// Requests teardown: graceful terminate first, forced kill once the
    /// grace period elapses. Idempotent; a no-op after the session stopped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Suspends until the session has fully stopped.
    pub async fn wait(&self) -> StopReason {
        let mut rx = self.finished_rx.clone();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return StopReason::Crashed { code: None };
            }
        }
    }

    async fn transition(&self, new: SessionState) {
        let mut guard = self.state.write().await;
        let old = *guard;
        if old == new {
            return;
        }
        *guard = new;
        drop(guard);

        let _ = self
            .events
            .send(LifecycleEvent::state_change(self.instance_id, old, new));
    }

    fn spawn_watcher(
        self: &Arc<Self>,
        store: Arc<dyn crate::store::InstanceStore>,
        grace: Duration,
        finished_tx: watch::Sender<Option<StopReason>>,
        on_stopped: Option<StoppedCallback>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            this.transition(SessionState::Running).await;
            info!(
                instance = %this.instance_id,
                pid = this.process.pid(),
                "session running"
            );

            if let Some(request) = this.mapping_request.clone() {
                this.spawn_exposure(request);
            }

            let reason = tokio::select! {
                exit = this.process.wait() => {
                    this.transition(SessionState::Stopping).await;
                    classify_exit(exit)
                }
                _ = this.cancel.cancelled() => {
                    this.transition(SessionState::Stopping).await;
                    this.shutdown_process(grace).await;
                    StopReason::Cancelled
                }
            };

            // Teardown runs the same way for clean exit, crash, and
            // cancellation: mappings first, then the playtime write.
            this.exposure.release_all().await;
            this.teardown.cancel();

            let delta_secs = this.started.elapsed().as_secs();
            if let Err(e) = store
                .update_playtime_and_last_played(this.instance_id, delta_secs, Utc::now())
                .await
            {
                error!(instance = %this.instance_id, error = %e, "failed to persist playtime");
            }

            this.transition(SessionState::Stopped(reason)).await;
            info!(
                instance = %this.instance_id,
                ?reason,
                playtime_secs = delta_secs,
                "session stopped"
            );

            let _ = finished_tx.send(Some(reason));
            if let Some(callback) = on_stopped {
                callback(this.instance_id);
            }
        });
    }

    fn spawn_exposure(self: &Arc<Self>, request: MappingRequest) {
        // Forward exposure updates into the session's event stream.
        let mut updates = self.exposure.subscribe();
        let events = self.events.clone();
        let instance_id = self.instance_id;
        let teardown = self.teardown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = teardown.cancelled() => break,
                    update = updates.recv() => match update {
                        Ok(update) => {
                            let _ = events.send(LifecycleEvent::exposure(instance_id, update));
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        let exposure = self.exposure.clone();
        tokio::spawn(async move {
            exposure.expose(request).await;
        });
    }

    async fn shutdown_process(&self, grace: Duration) {
        self.process.terminate();
        if timeout(grace, self.process.wait()).await.is_err() {
            warn!(
                instance = %self.instance_id,
                grace_secs = grace.as_secs(),
                "grace period elapsed, killing process"
            );
            self.process.kill();
            self.process.wait().await;
        }
    }
}

fn classify_exit(exit: ProcessExit) -> StopReason {
    if exit.clean() {
        StopReason::Exited
    } else {
        StopReason::Crashed { code: exit.code }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::doubles::*;
    use super::*;
    use crate::config::HostingConfig;
    use crate::net::exposure::ExposureState;

    #[tokio::test(start_paused = true)]
    async fn clean_exit_finalizes_playtime_without_mapping_calls() {
        let config = test_config(None);
        let instance_id = config.id;
        let process = FakeProcess::pending(true);
        let spawner = FakeSpawner::new(process.clone());
        let client = CountingClient::ok();
        let store = RecordingStore::with(config.clone());

        let supervisor = LaunchSupervisor::launch(
            test_spec(config),
            &spawner,
            client.clone(),
            store.clone(),
            LaunchSupervisor::DEFAULT_GRACE,
            None,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(supervisor.state().await, SessionState::Running);

        process.exit_with(0);
        let reason = supervisor.wait().await;

        assert_eq!(reason, StopReason::Exited);
        assert_eq!(
            supervisor.state().await,
            SessionState::Stopped(StopReason::Exited)
        );
        // LAN hosting disabled: the mapping client is never touched.
        assert_eq!(client.maps.load(Ordering::SeqCst), 0);
        assert_eq!(client.unmaps.load(Ordering::SeqCst), 0);

        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        let (id, delta, _) = writes[0];
        assert_eq!(id, instance_id);
        assert_eq!(delta, 120);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_crash_and_still_persisted() {
        let config = test_config(None);
        let process = FakeProcess::pending(true);
        let spawner = FakeSpawner::new(process.clone());
        let store = RecordingStore::with(config.clone());

        let supervisor = LaunchSupervisor::launch(
            test_spec(config),
            &spawner,
            CountingClient::ok(),
            store.clone(),
            LaunchSupervisor::DEFAULT_GRACE,
            None,
        )
        .unwrap();

        process.exit_with(1);
        let reason = supervisor.wait().await;
        assert_eq!(reason, StopReason::Crashed { code: Some(1) });
        // Crash finalizes exactly like clean exit: playtime saved.
        assert_eq!(store.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_mapping_leaves_session_running() {
        let config = test_config(Some(HostingConfig::tcp(25565)));
        let process = FakeProcess::pending(true);
        let spawner = FakeSpawner::new(process.clone());
        let client = CountingClient::rejecting();

        let supervisor = LaunchSupervisor::launch(
            test_spec(config.clone()),
            &spawner,
            client.clone(),
            RecordingStore::with(config),
            LaunchSupervisor::DEFAULT_GRACE,
            None,
        )
        .unwrap();

        // Let the exposure attempt run and fail.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.state().await, SessionState::Running);
        assert_eq!(
            supervisor
                .exposure()
                .state(25565, crate::config::Protocol::Tcp)
                .await,
            Some(ExposureState::Failed)
        );

        process.exit_with(0);
        assert_eq!(supervisor.wait().await, StopReason::Exited);
    }

    #[tokio::test]
    async fn hosting_session_releases_mapping_on_exit() {
        let config = test_config(Some(HostingConfig::tcp(25565)));
        let process = FakeProcess::pending(true);
        let spawner = FakeSpawner::new(process.clone());
        let client = CountingClient::ok();

        let supervisor = LaunchSupervisor::launch(
            test_spec(config.clone()),
            &spawner,
            client.clone(),
            RecordingStore::with(config),
            LaunchSupervisor::DEFAULT_GRACE,
            None,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.maps.load(Ordering::SeqCst), 1);

        process.exit_with(0);
        supervisor.wait().await;
        assert_eq!(client.unmaps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_terminates_gracefully_when_process_cooperates() {
        let config = test_config(None);
        let process = FakeProcess::pending(true);
        let spawner = FakeSpawner::new(process.clone());
        let store = RecordingStore::with(config.clone());

        let supervisor = LaunchSupervisor::launch(
            test_spec(config),
            &spawner,
            CountingClient::ok(),
            store,
            LaunchSupervisor::DEFAULT_GRACE,
            None,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        supervisor.cancel();
        let reason = supervisor.wait().await;
        assert_eq!(reason, StopReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_kills_after_grace_period() {
        let config = test_config(Some(HostingConfig::tcp(25565)));
        // Process ignores SIGTERM; only kill() ends it.
        let process = FakeProcess::pending(false);
        let spawner = FakeSpawner::new(process.clone());
        let client = CountingClient::ok();

        let supervisor = LaunchSupervisor::launch(
            test_spec(config.clone()),
            &spawner,
            client.clone(),
            RecordingStore::with(config),
            Duration::from_secs(5),
            None,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        supervisor.cancel();
        let reason = supervisor.wait().await;

        assert_eq!(reason, StopReason::Cancelled);
        // Mappings were torn down even though termination was forced.
        assert_eq!(client.unmaps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_synchronously() {
        let config = test_config(None);
        let process = FakeProcess::pending(true);
        let mut spawner = FakeSpawner::new(process);
        spawner.fail = true;

        let err = LaunchSupervisor::launch(
            test_spec(config.clone()),
            &spawner,
            CountingClient::ok(),
            RecordingStore::with(config),
            LaunchSupervisor::DEFAULT_GRACE,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(_)));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_spawn() {
        let mut config = test_config(None);
        config.memory_min = crate::config::MemorySize::Gigabytes(8);
        let process = FakeProcess::pending(true);
        let spawner = FakeSpawner::new(process);

        let err = LaunchSupervisor::launch(
            test_spec(config.clone()),
            &spawner,
            CountingClient::ok(),
            RecordingStore::with(config),
            LaunchSupervisor::DEFAULT_GRACE,
            None,
        )
        .unwrap_err();

        assert!(matches!(err, LaunchError::Configuration(_)));
        // Nothing was spawned.
        assert!(spawner.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_events_follow_the_state_machine() {
        use tokio_stream::StreamExt;

        use crate::session::event::LifecyclePayload;

        let config = test_config(None);
        let process = FakeProcess::pending(true);
        let spawner = FakeSpawner::new(process.clone());
        let store = RecordingStore::with(config.clone());

        let supervisor = LaunchSupervisor::launch(
            test_spec(config),
            &spawner,
            CountingClient::ok(),
            store,
            LaunchSupervisor::DEFAULT_GRACE,
            None,
        )
        .unwrap();
        let mut events = supervisor.subscribe();

        process.exit_with(0);
        supervisor.wait().await;

        let mut transitions = Vec::new();
        while let Ok(Some(Ok(event))) =
            tokio::time::timeout(Duration::from_millis(100), events.next()).await
        {
            if let LifecyclePayload::StateChange { old, new } = event.payload {
                transitions.push((old, new));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (SessionState::Starting, SessionState::Running),
                (SessionState::Running, SessionState::Stopping),
                (
                    SessionState::Stopping,
                    SessionState::Stopped(StopReason::Exited)
                ),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn playtime_is_monotonically_non_decreasing_across_cycles() {
        let store = RecordingStore::with(test_config(None));
        let mut previous_total = 0u64;

        for code in [0, 1, 0] {
            let config = test_config(None);
            let process = FakeProcess::pending(true);
            let spawner = FakeSpawner::new(process.clone());
            let supervisor = LaunchSupervisor::launch(
                test_spec(config),
                &spawner,
                CountingClient::ok(),
                store.clone(),
                LaunchSupervisor::DEFAULT_GRACE,
                None,
            )
            .unwrap();

            tokio::time::sleep(Duration::from_secs(10)).await;
            process.exit_with(code);
            supervisor.wait().await;

            let total = *store.playtime_total.lock().unwrap();
            assert!(total >= previous_total);
            previous_total = total;
        }
        assert_eq!(previous_total, 30);
    }
}
