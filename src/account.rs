use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKind {
    /// Token-backed account refreshed by the auth collaborator.
    Managed,
    Offline,
}

/// Account record as the account store hands it out. Read-only to the core;
/// last-used bookkeeping belongs to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub player_uuid: Uuid,
    pub display_name: String,
    pub kind: AccountKind,
    pub last_used: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

/// Launch-ready authentication material resolved immediately before spawn.
/// Consumed once and never persisted.
#[derive(Debug, Clone)]
pub struct Credential {
    pub player_uuid: Uuid,
    pub username: String,
    pub access_token: String,
    pub user_type: String,
}

impl Credential {
    pub fn offline(player_uuid: Uuid, username: impl Into<String>) -> Self {
        Self {
            player_uuid,
            username: username.into(),
            access_token: "0".to_string(),
            user_type: "legacy".to_string(),
        }
    }
}
