use crate::domain::model::{ObjectKey, ReconcileOutcome};
use crate::utils::error::{ErrorCategory, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

/// Summary of a single `--once` pass, written as JSON for scripts and cron jobs.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub services: Vec<ServiceReport>,
}

#[derive(Debug, Serialize)]
pub struct ServiceReport {
    pub service: String,
    #[serde(flatten)]
    pub status: ServiceStatus,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServiceStatus {
    Applied {
        mappings: usize,
        external_ip: Option<String>,
        requeue_after_seconds: u64,
    },
    Skipped {
        reason: String,
    },
    Failed {
        category: String,
        retryable: bool,
        error: String,
    },
}

impl RunReport {
    pub fn from_outcomes(outcomes: &[(ObjectKey, ReconcileOutcome)]) -> Self {
        let services: Vec<ServiceReport> = outcomes
            .iter()
            .map(|(key, outcome)| ServiceReport {
                service: key.to_string(),
                status: ServiceStatus::from(outcome),
            })
            .collect();

        let count = |f: fn(&ServiceStatus) -> bool| services.iter().filter(|s| f(&s.status)).count();

        Self {
            generated_at: Utc::now(),
            applied: count(|s| matches!(s, ServiceStatus::Applied { .. })),
            skipped: count(|s| matches!(s, ServiceStatus::Skipped { .. })),
            failed: count(|s| matches!(s, ServiceStatus::Failed { .. })),
            services,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub async fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path, self.to_json()?).await?;
        Ok(())
    }
}

impl From<&ReconcileOutcome> for ServiceStatus {
    fn from(outcome: &ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Applied {
                requeue_after,
                mappings,
                external_ip,
            } => ServiceStatus::Applied {
                mappings: *mappings,
                external_ip: external_ip.map(|ip| ip.to_string()),
                requeue_after_seconds: requeue_after.as_secs(),
            },
            ReconcileOutcome::Skipped { reason } => ServiceStatus::Skipped {
                reason: reason.to_string(),
            },
            ReconcileOutcome::Failed(e) => ServiceStatus::Failed {
                category: category_name(e.category()).to_string(),
                retryable: e.is_retryable(),
                error: e.to_string(),
            },
        }
    }
}

fn category_name(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Configuration => "configuration",
        ErrorCategory::Transient => "transient",
        ErrorCategory::Environment => "environment",
        ErrorCategory::Device => "device",
        ErrorCategory::System => "system",
    }
}
