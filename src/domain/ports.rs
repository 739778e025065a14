use crate::domain::model::{ObjectKey, PortForwardRequest, ProtocolVariant, ServiceObject};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A handle to one control endpoint on the gateway.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    fn variant(&self) -> ProtocolVariant;

    fn control_url(&self) -> &str;

    /// Idempotent for identical requests.
    async fn add_port_mapping(
        &self,
        request: &PortForwardRequest,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn get_external_ip_address(&self, cancel: &CancellationToken) -> Result<Ipv4Addr>;
}

/// Enumerates the gateway clients of one protocol variant.
#[async_trait]
pub trait GatewayDiscovery: Send + Sync {
    async fn discover(
        &self,
        variant: ProtocolVariant,
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<dyn GatewayClient>>>;
}

/// Source of desired-state objects.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ServiceObject>>;

    async fn list(&self) -> Result<Vec<ObjectKey>>;
}
