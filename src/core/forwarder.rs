use crate::domain::model::{PortForwardRequest, ServiceIntent, ServicePort, TransportProtocol};
use crate::domain::ports::GatewayClient;
use crate::utils::error::{HolepunchError, Result};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60 * 60);

/// Builds the request for one declared port.
pub fn build_request(
    internal_client: Ipv4Addr,
    port: &ServicePort,
    intent: &ServiceIntent,
    description: &str,
    lease: Duration,
) -> Result<PortForwardRequest> {
    let protocol = TransportProtocol::from_declared(port.port, &port.protocol)?;

    Ok(PortForwardRequest {
        remote_host: String::new(),
        external_port: intent.external_port(port.port),
        protocol,
        internal_port: port.port,
        internal_client,
        enabled: true,
        description: description.to_string(),
        lease_duration_secs: u32::try_from(lease.as_secs()).unwrap_or(u32::MAX),
    })
}

/// Installs one mapping per port, in order, and stops at the first failure.
///
/// Mappings installed before the failing port are left in place. Returns the number
/// of mappings installed.
pub async fn apply_forwards<C>(
    client: &C,
    internal_client: Ipv4Addr,
    ports: &[ServicePort],
    intent: &ServiceIntent,
    description: &str,
    lease: Duration,
    cancel: &CancellationToken,
) -> Result<usize>
where
    C: GatewayClient + ?Sized,
{
    for (applied, port) in ports.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(HolepunchError::Cancelled);
        }

        let request = build_request(internal_client, port, intent, description, lease)?;

        tracing::debug!(
            internal_port = request.internal_port,
            external_port = request.external_port,
            protocol = %request.protocol,
            "Adding port mapping"
        );

        client
            .add_port_mapping(&request, cancel)
            .await
            .map_err(|e| match e {
                HolepunchError::Cancelled => HolepunchError::Cancelled,
                other => HolepunchError::PortForwardFailed {
                    internal_port: request.internal_port,
                    external_port: request.external_port,
                    protocol: request.protocol.to_string(),
                    source: Box::new(other),
                },
            })?;

        tracing::info!(
            "🔓 Forwarded {} {} -> {}:{} ({}/{})",
            request.protocol,
            request.external_port,
            request.internal_client,
            request.internal_port,
            applied + 1,
            ports.len()
        );
    }

    Ok(ports.len())
}
