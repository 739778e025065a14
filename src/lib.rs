pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliArgs;
pub use config::HolepunchConfig;

pub use adapters::igd::{DiscoveryMode, IgdDiscovery};
pub use adapters::manifest::ManifestStore;
pub use core::{controller::Controller, reconciler::Reconciler};
pub use utils::error::{HolepunchError, Result};
