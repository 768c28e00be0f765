//! Instance launch and LAN exposure supervisor engine.
//!
//! Turns a stored instance configuration into a running, monitored JVM
//! process, optionally maps a router port so LAN peers can join a hosted
//! game, and tears everything down cleanly on exit, crash, or cancellation.
//! Storage, validation, and auth refresh are consumed through the trait
//! contracts in [`store`].

pub mod account;
pub mod config;
pub mod error;
pub mod java;
pub mod launch;
pub mod net;
pub mod process;
pub mod session;
pub mod store;

pub use account::{Account, AccountId, AccountKind, Credential};
pub use config::{HostingConfig, InstanceConfig, InstanceId, MemorySize, Protocol, Resolution};
pub use error::{ConfigurationError, LaunchError, MappingError, SpawnError, StoreError};
pub use java::JavaRuntime;
pub use launch::{PreparedRuntime, build_arguments};
pub use net::exposure::{ExposureState, ExposureUpdate, NetworkExposureManager};
pub use net::{MappingRequest, PortMappingClient};
pub use process::{ProcessExit, ProcessHandle, ProcessSpawner, TokioSpawner};
pub use session::event::{LifecycleEvent, LifecyclePayload};
pub use session::registry::SupervisorRegistry;
pub use session::supervisor::{LaunchSpec, LaunchSupervisor};
pub use session::{SessionInfo, SessionState, StopReason};

#[cfg(feature = "upnp")]
pub use net::upnp::UpnpClient;
