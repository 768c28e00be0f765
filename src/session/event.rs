use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{config::InstanceId, net::exposure::ExposureUpdate, session::SessionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecyclePayload {
    StateChange {
        old: SessionState,
        new: SessionState,
    },
    Exposure(ExposureUpdate),
}

/// Notification emitted on every session transition, consumed by UI and
/// other collaborators through a broadcast subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub instance_id: InstanceId,
    pub payload: LifecyclePayload,
}

impl LifecycleEvent {
    pub fn state_change(instance_id: InstanceId, old: SessionState, new: SessionState) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            instance_id,
            payload: LifecyclePayload::StateChange { old, new },
        }
    }

    pub fn exposure(instance_id: InstanceId, update: ExposureUpdate) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            instance_id,
            payload: LifecyclePayload::Exposure(update),
        }
    }
}

impl Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            LifecyclePayload::StateChange { old, new } => {
                write!(f, "[{}] {:?} -> {:?}", self.instance_id, old, new)
            }
            LifecyclePayload::Exposure(update) => {
                write!(
                    f,
                    "[{}] port {}/{} is {:?}",
                    self.instance_id, update.port, update.protocol, update.state
                )
            }
        }
    }
}
