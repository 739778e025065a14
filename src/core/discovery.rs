use crate::domain::model::ProtocolVariant;
use crate::domain::ports::{GatewayClient, GatewayDiscovery};
use crate::utils::error::{HolepunchError, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Probes every protocol variant concurrently and picks one client.
///
/// All probes run to completion even when some fail. The first candidate of the
/// highest-priority variant wins, regardless of which probe finished first. Probe
/// errors only fail the selection when no variant produced a candidate.
pub async fn select_gateway<D>(
    discovery: &D,
    cancel: &CancellationToken,
) -> Result<Arc<dyn GatewayClient>>
where
    D: GatewayDiscovery + ?Sized,
{
    let probes = ProtocolVariant::ALL.iter().map(|&variant| async move {
        let result = discovery.discover(variant, cancel).await;
        (variant, result)
    });

    let mut results = join_all(probes).await;
    results.sort_by_key(|(variant, _)| variant.priority());

    if cancel.is_cancelled() {
        return Err(HolepunchError::Cancelled);
    }

    let mut errors = Vec::new();
    let mut selected: Option<Arc<dyn GatewayClient>> = None;

    for (variant, result) in results {
        match result {
            Ok(clients) => {
                tracing::debug!(%variant, candidates = clients.len(), "Gateway probe finished");
                if selected.is_none() {
                    selected = clients.into_iter().next();
                }
            }
            Err(e) => {
                tracing::debug!(%variant, error = %e, "Gateway probe failed");
                errors.push(format!("{}: {}", variant, e));
            }
        }
    }

    match selected {
        Some(client) => {
            if !errors.is_empty() {
                tracing::warn!(
                    ignored_errors = errors.len(),
                    "Some gateway probes failed, using the gateway that answered: {}",
                    errors.join("; ")
                );
            }
            tracing::info!(
                variant = %client.variant(),
                control_url = client.control_url(),
                "🌐 Selected gateway"
            );
            Ok(client)
        }
        None => Err(HolepunchError::NoGatewayFound { errors }),
    }
}
