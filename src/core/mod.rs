pub mod annotations;
pub mod controller;
pub mod discovery;
pub mod forwarder;
pub mod reconciler;
pub mod report;

pub use crate::domain::model::{ObjectKey, ReconcileOutcome, ServiceIntent, ServiceObject};
pub use crate::domain::ports::{GatewayClient, GatewayDiscovery, ServiceStore};
pub use crate::utils::error::Result;
