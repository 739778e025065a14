use crate::core::reconciler::Reconciler;
use crate::domain::model::{ObjectKey, ReconcileOutcome, ServiceObject, SkipReason};
use crate::domain::ports::{GatewayDiscovery, ServiceStore};
use crate::utils::error::{HolepunchError, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub resync_interval: Duration,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(300),
        }
    }
}

/// Decides how long a worker waits before the next pass. `None` stops the worker.
pub fn next_delay(
    outcome: &ReconcileOutcome,
    settings: &ControllerSettings,
    consecutive_failures: &mut u32,
) -> Option<Duration> {
    match outcome {
        ReconcileOutcome::Applied { requeue_after, .. } => {
            *consecutive_failures = 0;
            Some(*requeue_after)
        }
        ReconcileOutcome::Skipped {
            reason: SkipReason::NotFound,
        } => None,
        ReconcileOutcome::Skipped {
            reason: SkipReason::NotOptedIn,
        } => {
            *consecutive_failures = 0;
            Some(settings.resync_interval)
        }
        ReconcileOutcome::Failed(HolepunchError::Cancelled) => None,
        ReconcileOutcome::Failed(e) if e.is_retryable() => {
            let exponent = (*consecutive_failures).min(16);
            *consecutive_failures = consecutive_failures.saturating_add(1);
            let backoff = settings
                .retry_delay
                .saturating_mul(2u32.saturating_pow(exponent));
            Some(backoff.min(settings.max_retry_delay))
        }
        // 需要人工修正，等下一次 resync 再看
        ReconcileOutcome::Failed(_) => Some(settings.resync_interval),
    }
}

/// Drives reconciliation for every service in the store.
///
/// Each object gets exactly one worker, so passes for the same object never overlap;
/// different objects are reconciled concurrently.
pub struct Controller<S: ServiceStore + 'static, D: GatewayDiscovery + 'static> {
    reconciler: Arc<Reconciler<S, D>>,
    settings: ControllerSettings,
}

impl<S: ServiceStore + 'static, D: GatewayDiscovery + 'static> Controller<S, D> {
    pub fn new(reconciler: Reconciler<S, D>, settings: ControllerSettings) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            settings,
        }
    }

    /// Reconciles every listed service once, concurrently.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<(ObjectKey, ReconcileOutcome)>> {
        let keys = self.reconciler.store().list().await?;
        tracing::info!("🔍 Reconciling {} services once", keys.len());

        let passes = keys.into_iter().map(|key| async move {
            let outcome = self.reconciler.reconcile(&key, cancel).await;
            (key, outcome)
        });

        Ok(join_all(passes).await)
    }

    /// Runs until `cancel` fires, then waits for the workers to stop.
    ///
    /// Every resync tick starts workers for new keys and wakes the worker of any key
    /// whose stored object changed since the last tick.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut workers: HashMap<ObjectKey, Worker> = HashMap::new();
        let mut resync = tokio::time::interval(self.settings.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            resync_secs = self.settings.resync_interval.as_secs(),
            "🚀 Controller started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = resync.tick() => {
                    workers.retain(|_, worker| !worker.handle.is_finished());

                    let keys = match self.reconciler.store().list().await {
                        Ok(keys) => keys,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to list services");
                            continue;
                        }
                    };

                    for key in keys {
                        let observed = match self.reconciler.store().get(&key).await {
                            Ok(observed) => observed,
                            Err(e) => {
                                tracing::warn!(service = %key, error = %e, "Failed to fetch service");
                                continue;
                            }
                        };

                        if let Some(worker) = workers.get_mut(&key) {
                            if worker.observed != observed {
                                tracing::debug!(service = %key, "Service changed, waking worker");
                                worker.observed = observed;
                                worker.wake.notify_one();
                            }
                            continue;
                        }

                        tracing::debug!(service = %key, "Starting worker");
                        let wake = Arc::new(Notify::new());
                        let handle = tokio::spawn(run_worker(
                            self.reconciler.clone(),
                            key.clone(),
                            self.settings,
                            wake.clone(),
                            cancel.child_token(),
                        ));
                        workers.insert(
                            key,
                            Worker {
                                handle,
                                wake,
                                observed,
                            },
                        );
                    }
                }
            }
        }

        tracing::info!("Shutting down {} workers", workers.len());
        for (key, worker) in workers {
            if let Err(e) = worker.handle.await {
                tracing::warn!(service = %key, error = %e, "Worker ended abnormally");
            }
        }

        Ok(())
    }
}

struct Worker {
    handle: JoinHandle<()>,
    wake: Arc<Notify>,
    /// Object as seen at the last resync tick.
    observed: Option<ServiceObject>,
}

async fn run_worker<S, D>(
    reconciler: Arc<Reconciler<S, D>>,
    key: ObjectKey,
    settings: ControllerSettings,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) where
    S: ServiceStore + 'static,
    D: GatewayDiscovery + 'static,
{
    let mut failures = 0u32;

    loop {
        let outcome = reconciler.reconcile(&key, &cancel).await;

        let Some(delay) = next_delay(&outcome, &settings, &mut failures) else {
            tracing::debug!(service = %key, "Worker stopped");
            return;
        };
        tracing::debug!(service = %key, delay_secs = delay.as_secs(), "Next pass scheduled");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {
                // 期望狀態變更，立即重新調和
                failures = 0;
            }
        }
    }
}
