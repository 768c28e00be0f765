use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    account::{AccountId, Credential},
    config::{InstanceConfig, InstanceId},
    error::StoreError,
};

/// Read/write contract over the instances table. The core reads one snapshot
/// per launch and issues a single playtime write per finished session.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, id: InstanceId) -> Result<InstanceConfig, StoreError>;

    /// Adds `delta_secs` to cumulative playtime and sets last-played.
    /// Playtime only ever grows; callers never pass a replacement total.
    async fn update_playtime_and_last_played(
        &self,
        id: InstanceId,
        delta_secs: u64,
        played_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Account collaborator. Token refresh happens behind this boundary; the
/// core only sees a launch-ready credential or a failure.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn resolve_credential(&self, id: AccountId) -> Result<Credential, StoreError>;
}
