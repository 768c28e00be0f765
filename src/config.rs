use std::{
    fmt::{self, Display},
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigurationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Memory bound expressed in whole units, rendered as a JVM `-Xms`/`-Xmx`
/// suffix (`2G`, `2048M`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemorySize {
    Gigabytes(u32),
    Megabytes(u32),
}

impl MemorySize {
    pub fn as_megabytes(&self) -> u64 {
        match self {
            MemorySize::Gigabytes(g) => u64::from(*g) * 1024,
            MemorySize::Megabytes(m) => u64::from(*m),
        }
    }
}

impl Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySize::Gigabytes(g) => write!(f, "{}G", g),
            MemorySize::Megabytes(m) => write!(f, "{}M", m),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModLoader {
    Fabric { version: String },
    Forge { version: String },
    NeoForge { version: String },
    Quilt { version: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// LAN hosting request attached to an instance. Present means the session
/// asks the exposure manager to map `port` for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostingConfig {
    pub port: u16,
    pub protocol: Protocol,
    pub lease_secs: u32,
}

impl HostingConfig {
    pub const DEFAULT_LEASE_SECS: u32 = 3600;

    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            lease_secs: Self::DEFAULT_LEASE_SECS,
        }
    }
}

/// Immutable-at-launch snapshot of one configured game installation.
///
/// Construction goes through [`InstanceConfig::validated`] so the memory
/// bound invariant holds before the core ever sees the value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: InstanceId,
    pub name: String,
    pub game_version: String,
    pub version_type: String,
    pub loader: Option<ModLoader>,
    pub java_major: u32,
    pub java_path: Option<PathBuf>,
    pub memory_min: MemorySize,
    pub memory_max: MemorySize,
    pub resolution: Option<Resolution>,
    pub extra_jvm_args: Vec<String>,
    pub extra_game_args: Vec<String>,
    pub icon: Option<String>,
    pub playtime_secs: u64,
    pub last_played: Option<DateTime<Utc>>,
    pub hosting: Option<HostingConfig>,
}

impl InstanceConfig {
    /// Checks the cross-field invariants the stores are expected to have
    /// enforced already. The supervisor refuses unvalidated snapshots.
    pub fn validated(self) -> Result<Self, ConfigurationError> {
        if self.name.is_empty() {
            return Err(ConfigurationError::MissingField("name"));
        }
        if self.game_version.is_empty() {
            return Err(ConfigurationError::MissingField("game_version"));
        }
        if self.memory_min.as_megabytes() > self.memory_max.as_megabytes() {
            return Err(ConfigurationError::MemoryBounds {
                min: self.memory_min.to_string(),
                max: self.memory_max.to_string(),
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> InstanceConfig {
        InstanceConfig {
            id: InstanceId::new(),
            name: "main".to_string(),
            game_version: "1.21.4".to_string(),
            version_type: "release".to_string(),
            loader: None,
            java_major: 21,
            java_path: None,
            memory_min: MemorySize::Gigabytes(2),
            memory_max: MemorySize::Gigabytes(4),
            resolution: None,
            extra_jvm_args: Vec::new(),
            extra_game_args: Vec::new(),
            icon: None,
            playtime_secs: 0,
            last_played: None,
            hosting: None,
        }
    }

    #[test]
    fn memory_size_renders_jvm_suffix() {
        assert_eq!(MemorySize::Gigabytes(2).to_string(), "2G");
        assert_eq!(MemorySize::Megabytes(2048).to_string(), "2048M");
        assert_eq!(MemorySize::Gigabytes(2).as_megabytes(), 2048);
    }

    #[test]
    fn validated_accepts_mixed_units() {
        let mut cfg = base_config();
        cfg.memory_min = MemorySize::Megabytes(2048);
        cfg.memory_max = MemorySize::Gigabytes(2);
        assert!(cfg.validated().is_ok());
    }

    #[test]
    fn validated_rejects_inverted_memory_bounds() {
        let mut cfg = base_config();
        cfg.memory_min = MemorySize::Gigabytes(8);
        cfg.memory_max = MemorySize::Gigabytes(4);
        assert!(matches!(
            cfg.validated(),
            Err(ConfigurationError::MemoryBounds { .. })
        ));
    }

    #[test]
    fn snapshot_survives_json_round_trip() {
        let mut cfg = base_config();
        cfg.loader = Some(ModLoader::Fabric {
            version: "0.16.9".to_string(),
        });
        cfg.hosting = Some(HostingConfig::tcp(25565));

        let json = serde_json::to_string(&cfg).unwrap();
        let back: InstanceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, cfg.id);
        assert_eq!(back.loader, cfg.loader);
        assert_eq!(back.hosting, cfg.hosting);
        assert_eq!(back.memory_max, cfg.memory_max);
    }

    #[test]
    fn validated_rejects_empty_name() {
        let mut cfg = base_config();
        cfg.name = String::new();
        assert!(matches!(
            cfg.validated(),
            Err(ConfigurationError::MissingField("name"))
        ));
    }
}
