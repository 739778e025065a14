use crate::core::annotations::parse_intent;
use crate::core::discovery::select_gateway;
use crate::core::forwarder::{apply_forwards, DEFAULT_LEASE_DURATION};
use crate::domain::model::{ObjectKey, ReconcileOutcome, ServiceType, SkipReason};
use crate::domain::ports::{GatewayDiscovery, ServiceStore};
use crate::utils::error::{ErrorCategory, HolepunchError, Result};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub duration: Duration,
    pub refresh_margin: Duration,
}

impl LeasePolicy {
    /// Delay before the next pass, so the lease is refreshed before it expires.
    pub fn requeue_after(&self) -> Duration {
        self.duration.saturating_sub(self.refresh_margin)
    }
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            duration: DEFAULT_LEASE_DURATION,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }
}

pub fn forward_description(key: &ObjectKey) -> String {
    format!("holepunch {}", key)
}

/// Runs one reconciliation pass per call. Gateways are rediscovered on every pass.
pub struct Reconciler<S: ServiceStore, D: GatewayDiscovery> {
    store: S,
    discovery: D,
    lease: LeasePolicy,
}

impl<S: ServiceStore, D: GatewayDiscovery> Reconciler<S, D> {
    pub fn new(store: S, discovery: D, lease: LeasePolicy) -> Self {
        Self {
            store,
            discovery,
            lease,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[tracing::instrument(name = "reconcile", skip(self, key, cancel), fields(service = %key))]
    pub async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> ReconcileOutcome {
        match self.try_reconcile(key, cancel).await {
            Ok(outcome) => {
                match &outcome {
                    ReconcileOutcome::Skipped { reason } => {
                        tracing::debug!(%reason, "Skipping service");
                    }
                    ReconcileOutcome::Applied {
                        requeue_after,
                        mappings,
                        external_ip,
                    } => {
                        let refresh_at = chrono::Utc::now()
                            + chrono::Duration::from_std(*requeue_after)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        tracing::info!(
                            mappings,
                            external_ip = ?external_ip,
                            requeue_after_secs = requeue_after.as_secs(),
                            refresh_at = %refresh_at.to_rfc3339(),
                            "✅ Port forwards applied"
                        );
                    }
                    ReconcileOutcome::Failed(_) => {}
                }
                outcome
            }
            Err(e) => {
                match e.category() {
                    ErrorCategory::Transient => {
                        tracing::info!(error = %e, "Service not ready yet")
                    }
                    _ => tracing::error!(
                        error = %e,
                        category = ?e.category(),
                        retryable = e.is_retryable(),
                        "❌ Reconciliation failed"
                    ),
                }
                ReconcileOutcome::Failed(e)
            }
        }
    }

    async fn try_reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        // Fetching
        let Some(service) = self.store.get(key).await? else {
            return Ok(ReconcileOutcome::Skipped {
                reason: SkipReason::NotFound,
            });
        };

        // Validating
        let intent = parse_intent(&service.annotations)?;
        if !intent.opted_in {
            return Ok(ReconcileOutcome::Skipped {
                reason: SkipReason::NotOptedIn,
            });
        }

        if service.service_type != ServiceType::LoadBalancer {
            return Err(HolepunchError::NotLoadBalancer {
                service_type: service.service_type.to_string(),
            });
        }

        let internal_client: Ipv4Addr = service
            .ingress_ipv4()
            .ok_or(HolepunchError::NoIpAllocatedYet)?;

        tracing::info!(%internal_client, ports = service.ports.len(), "Identified service of interest");

        // Discovering
        let gateway = select_gateway(&self.discovery, cancel).await?;

        // Applying
        let mappings = apply_forwards(
            gateway.as_ref(),
            internal_client,
            &service.ports,
            &intent,
            &forward_description(key),
            self.lease.duration,
            cancel,
        )
        .await?;

        let external_ip = match gateway.get_external_ip_address(cancel).await {
            Ok(ip) => Some(ip),
            Err(HolepunchError::Cancelled) => return Err(HolepunchError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "Could not query the gateway's external address");
                None
            }
        };

        // Scheduled
        Ok(ReconcileOutcome::Applied {
            requeue_after: self.lease.requeue_after(),
            mappings,
            external_ip,
        })
    }
}
