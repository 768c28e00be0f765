use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Protocol,
    net::{MappingRequest, PortMappingClient},
};

/// Lifecycle of one requested port mapping.
///
/// `Requested → Mapped → (refresh loop) → Released`, or `Requested → Failed`
/// when the client cannot map. A refresh failure downgrades `Mapped` to
/// `Failed`; the owning session is never torn down over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureState {
    Requested,
    Mapped,
    Failed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureUpdate {
    pub port: u16,
    pub protocol: Protocol,
    pub state: ExposureState,
}

struct MappingEntry {
    state: ExposureState,
    refresh: CancellationToken,
}

/// Owns every mapping a session holds. Maps on request, renews leases before
/// TTL expiry, unmaps on release, and guarantees no lease outlives its
/// session: `release_all` runs during teardown regardless of how the process
/// died, and the router-side TTL is the backstop if even that fails.
pub struct NetworkExposureManager {
    client: Arc<dyn PortMappingClient>,
    mappings: Arc<Mutex<HashMap<(u16, Protocol), MappingEntry>>>,
    updates: broadcast::Sender<ExposureUpdate>,
}

impl NetworkExposureManager {
    pub fn new(client: Arc<dyn PortMappingClient>) -> Self {
        Self {
            client,
            mappings: Arc::new(Mutex::new(HashMap::new())),
            updates: broadcast::Sender::new(64),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExposureUpdate> {
        self.updates.subscribe()
    }

    pub async fn state(&self, port: u16, protocol: Protocol) -> Option<ExposureState> {
        self.mappings
            .lock()
            .await
            .get(&(port, protocol))
            .map(|e| e.state)
    }

    /// Requests the mapping and, on success, schedules lease renewal at half
    /// the TTL. Returns the resulting state; mapping failure is a degraded
    /// outcome, not an error.
    pub async fn expose(&self, request: MappingRequest) -> ExposureState {
        let key = (request.external_port, request.protocol);
        {
            let mut mappings = self.mappings.lock().await;
            match mappings.get(&key) {
                Some(entry)
                    if entry.state == ExposureState::Requested
                        || entry.state == ExposureState::Mapped =>
                {
                    return entry.state;
                }
                _ => {}
            }
            mappings.insert(
                key,
                MappingEntry {
                    state: ExposureState::Requested,
                    refresh: CancellationToken::new(),
                },
            );
        }
        self.publish(key, ExposureState::Requested).await;

        match self.client.map(&request).await {
            Ok(()) => {
                info!(
                    port = request.external_port,
                    protocol = %request.protocol,
                    lease_secs = request.lease_secs,
                    "port mapped"
                );
                match self.set_state(key, ExposureState::Mapped).await {
                    Some(token) => {
                        // Lease 0 means a permanent mapping; nothing to renew.
                        if request.lease_secs > 0 {
                            self.spawn_refresh(request, token);
                        }
                        ExposureState::Mapped
                    }
                    // A concurrent release won; set_state already unmapped.
                    None => ExposureState::Released,
                }
            }
            Err(e) => {
                warn!(port = request.external_port, error = %e, "port mapping failed");
                self.set_state(key, ExposureState::Failed).await;
                ExposureState::Failed
            }
        }
    }

    /// Idempotent: releasing an already-released or never-mapped port is a
    /// no-op. Local state wins; a refused router-side unmap only logs.
    pub async fn release(&self, port: u16, protocol: Protocol) {
        let key = (port, protocol);
        let was_mapped = {
            let mut mappings = self.mappings.lock().await;
            match mappings.get_mut(&key) {
                Some(entry) if entry.state != ExposureState::Released => {
                    entry.refresh.cancel();
                    let was_mapped = entry.state == ExposureState::Mapped;
                    entry.state = ExposureState::Released;
                    was_mapped
                }
                _ => return,
            }
        };
        self.publish(key, ExposureState::Released).await;

        if was_mapped {
            if let Err(e) = self.client.unmap(port, protocol).await {
                warn!(port, error = %e, "router-side unmap failed, lease TTL will expire it");
            } else {
                debug!(port, "port unmapped");
            }
        }
    }

    /// Releases every mapping still held. Called once per session teardown.
    pub async fn release_all(&self) {
        let keys: Vec<(u16, Protocol)> = {
            let mappings = self.mappings.lock().await;
            mappings
                .iter()
                .filter(|(_, e)| e.state != ExposureState::Released)
                .map(|(k, _)| *k)
                .collect()
        };
        for (port, protocol) in keys {
            self.release(port, protocol).await;
        }
    }

    /// Updates entry state; returns a fresh refresh token when the new state
    /// is Mapped.
    async fn set_state(
        &self,
        key: (u16, Protocol),
        state: ExposureState,
    ) -> Option<CancellationToken> {
        let (stale, token) = {
            let mut mappings = self.mappings.lock().await;
            let entry = mappings.get_mut(&key)?;
            if entry.state == ExposureState::Released {
                (true, None)
            } else {
                entry.state = state;
                (
                    false,
                    (state == ExposureState::Mapped).then(|| entry.refresh.clone()),
                )
            }
        };
        if stale {
            // Released while the map call was in flight. A successful map
            // means the router now holds a lease nothing tracks; clear it.
            if state == ExposureState::Mapped {
                if let Err(e) = self.client.unmap(key.0, key.1).await {
                    warn!(port = key.0, error = %e, "unmap of raced lease failed, TTL will expire it");
                }
            }
            return None;
        }
        self.publish(key, state).await;
        token
    }

    fn spawn_refresh(&self, request: MappingRequest, token: CancellationToken) {
        let client = self.client.clone();
        let mappings = self.mappings.clone();
        let updates = self.updates.clone();
        let interval = Duration::from_secs(u64::from(request.lease_secs.max(2)) / 2);
        let key = (request.external_port, request.protocol);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match client.map(&request).await {
                    Ok(()) => {
                        debug!(port = request.external_port, "lease renewed");
                    }
                    Err(e) => {
                        warn!(port = request.external_port, error = %e, "lease renewal failed");
                        let mut guard = mappings.lock().await;
                        if let Some(entry) = guard.get_mut(&key) {
                            if entry.state == ExposureState::Mapped {
                                entry.state = ExposureState::Failed;
                                let _ = updates.send(ExposureUpdate {
                                    port: key.0,
                                    protocol: key.1,
                                    state: ExposureState::Failed,
                                });
                            }
                        }
                        break;
                    }
                }
            }
        });
    }

    async fn publish(&self, key: (u16, Protocol), state: ExposureState) {
        let _ = self.updates.send(ExposureUpdate {
            port: key.0,
            protocol: key.1,
            state,
        });
    }
}
