// Adapters layer: concrete implementations of the domain ports (gateway protocol, service store).

pub mod igd;
pub mod manifest;
pub mod ssdp;
