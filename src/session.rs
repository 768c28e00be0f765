use chrono::{DateTime, Utc};

use crate::{account::AccountId, config::InstanceId};

pub mod event;
pub mod registry;
pub mod supervisor;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Process exited on its own with code 0.
    Exited,
    /// Abnormal exit: non-zero code, or killed by the OS.
    Crashed { code: Option<i32> },
    /// Teardown was caller-initiated before natural exit.
    Cancelled,
}

/// Lifecycle of one launch session. Illegal operations (mapping ports after
/// Stopped, double finalization) are ruled out by matching on this rather
/// than by flag bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped(StopReason),
}

impl SessionState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, SessionState::Stopped(_))
    }
}

/// Point-in-time snapshot of a live session, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub instance_id: InstanceId,
    pub account_id: AccountId,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
}
