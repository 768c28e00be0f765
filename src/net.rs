use async_trait::async_trait;

use crate::{config::Protocol, error::MappingError};

pub mod exposure;
#[cfg(feature = "upnp")]
pub mod upnp;

/// One requested router-side port-forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRequest {
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: Protocol,
    pub lease_secs: u32,
    pub description: String,
}

/// Adapter over a router-control protocol. Implementations bound every call
/// with a timeout and a small retry budget; callers treat all failures as
/// recoverable.
#[async_trait]
pub trait PortMappingClient: Send + Sync {
    async fn map(&self, request: &MappingRequest) -> Result<(), MappingError>;

    /// Removing a rule the router no longer holds is success, not an error.
    async fn unmap(&self, external_port: u16, protocol: Protocol) -> Result<(), MappingError>;
}
