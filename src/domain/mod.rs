// Domain layer: core models and ports (interfaces). No I/O here, adapters implement the ports.

pub mod model;
pub mod ports;
