use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::utils::error::HolepunchError;

/// Identifies one desired-state object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl Default for ServiceType {
    fn default() -> Self {
        ServiceType::ClusterIP
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::ExternalName => "ExternalName",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
    /// 保留原始字串，讓不支援的協定（例如 SCTP）能在套用時被回報
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

impl ServicePort {
    pub fn tcp(port: u16) -> Self {
        Self {
            name: None,
            port,
            protocol: default_protocol(),
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            name: None,
            port,
            protocol: "UDP".to_string(),
        }
    }
}

/// The desired-state object handed to the reconciler by the service store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceObject {
    pub namespace: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub load_balancer_ips: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ServiceObject {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// First allocated load balancer address that is IPv4.
    pub fn ingress_ipv4(&self) -> Option<Ipv4Addr> {
        self.load_balancer_ips
            .iter()
            .find_map(|ip| ip.trim().parse::<Ipv4Addr>().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Udp => "UDP",
        }
    }

    /// Maps a declared service protocol onto the two the gateway can forward.
    pub fn from_declared(port: u16, protocol: &str) -> Result<Self, HolepunchError> {
        match protocol {
            "TCP" => Ok(TransportProtocol::Tcp),
            "UDP" => Ok(TransportProtocol::Udp),
            other => Err(HolepunchError::UnsupportedProtocol {
                port,
                protocol: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forwarding intent derived from a service's annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceIntent {
    pub opted_in: bool,
    pub port_remap: HashMap<u16, u16>,
}

impl ServiceIntent {
    pub fn external_port(&self, internal_port: u16) -> u16 {
        self.port_remap
            .get(&internal_port)
            .copied()
            .unwrap_or(internal_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardRequest {
    /// Empty means any remote host.
    pub remote_host: String,
    pub external_port: u16,
    pub protocol: TransportProtocol,
    pub internal_port: u16,
    pub internal_client: Ipv4Addr,
    pub enabled: bool,
    pub description: String,
    pub lease_duration_secs: u32,
}

#[derive(Debug)]
pub enum ReconcileOutcome {
    Skipped { reason: SkipReason },
    Failed(HolepunchError),
    Applied {
        requeue_after: Duration,
        mappings: usize,
        external_ip: Option<Ipv4Addr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    NotOptedIn,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotFound => f.write_str("service no longer exists"),
            SkipReason::NotOptedIn => f.write_str("service is not opted in"),
        }
    }
}

/// Generation of the InternetGatewayDevice root device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IgdGeneration {
    V1,
    V2,
}

impl IgdGeneration {
    pub fn device_urn(&self) -> &'static str {
        match self {
            IgdGeneration::V1 => "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
            IgdGeneration::V2 => "urn:schemas-upnp-org:device:InternetGatewayDevice:2",
        }
    }
}

/// One control-protocol dialect a gateway may speak.
///
/// [`ProtocolVariant::ALL`] is ordered by selection priority: IP connections before
/// PPP connections, newer service versions and device generations first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVariant {
    Igd2WanIpConnection2,
    Igd2WanIpConnection1,
    Igd1WanIpConnection1,
    Igd2WanPppConnection1,
    Igd1WanPppConnection1,
}

impl ProtocolVariant {
    pub const ALL: [ProtocolVariant; 5] = [
        ProtocolVariant::Igd2WanIpConnection2,
        ProtocolVariant::Igd2WanIpConnection1,
        ProtocolVariant::Igd1WanIpConnection1,
        ProtocolVariant::Igd2WanPppConnection1,
        ProtocolVariant::Igd1WanPppConnection1,
    ];

    pub fn generation(&self) -> IgdGeneration {
        match self {
            ProtocolVariant::Igd2WanIpConnection2
            | ProtocolVariant::Igd2WanIpConnection1
            | ProtocolVariant::Igd2WanPppConnection1 => IgdGeneration::V2,
            ProtocolVariant::Igd1WanIpConnection1 | ProtocolVariant::Igd1WanPppConnection1 => {
                IgdGeneration::V1
            }
        }
    }

    pub fn service_urn(&self) -> &'static str {
        match self {
            ProtocolVariant::Igd2WanIpConnection2 => "urn:schemas-upnp-org:service:WANIPConnection:2",
            ProtocolVariant::Igd2WanIpConnection1 | ProtocolVariant::Igd1WanIpConnection1 => {
                "urn:schemas-upnp-org:service:WANIPConnection:1"
            }
            ProtocolVariant::Igd2WanPppConnection1 | ProtocolVariant::Igd1WanPppConnection1 => {
                "urn:schemas-upnp-org:service:WANPPPConnection:1"
            }
        }
    }

    /// Position in the selection order, lower wins.
    pub fn priority(&self) -> usize {
        ProtocolVariant::ALL
            .iter()
            .position(|v| v == self)
            .unwrap_or(ProtocolVariant::ALL.len())
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolVariant::Igd2WanIpConnection2 => "IGD:2 WANIPConnection:2",
            ProtocolVariant::Igd2WanIpConnection1 => "IGD:2 WANIPConnection:1",
            ProtocolVariant::Igd1WanIpConnection1 => "IGD:1 WANIPConnection:1",
            ProtocolVariant::Igd2WanPppConnection1 => "IGD:2 WANPPPConnection:1",
            ProtocolVariant::Igd1WanPppConnection1 => "IGD:1 WANPPPConnection:1",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingress_ipv4_skips_ipv6_and_garbage() {
        let service = ServiceObject {
            namespace: "default".to_string(),
            name: "web".to_string(),
            service_type: ServiceType::LoadBalancer,
            ports: vec![ServicePort::tcp(80)],
            load_balancer_ips: vec!["fd00::10".to_string(), "pending".to_string(), "10.0.0.7".to_string()],
            annotations: BTreeMap::new(),
        };
        assert_eq!(service.ingress_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(service.key().to_string(), "default/web");
    }

    #[test]
    fn test_transport_protocol_is_case_sensitive() {
        assert_eq!(TransportProtocol::from_declared(53, "UDP").unwrap(), TransportProtocol::Udp);
        assert!(matches!(
            TransportProtocol::from_declared(9, "SCTP"),
            Err(HolepunchError::UnsupportedProtocol { port: 9, .. })
        ));
        assert!(TransportProtocol::from_declared(80, "tcp").is_err());
    }

    #[test]
    fn test_variant_priority_prefers_ip_then_newer() {
        assert_eq!(ProtocolVariant::Igd2WanIpConnection2.priority(), 0);
        assert!(
            ProtocolVariant::Igd1WanIpConnection1.priority()
                < ProtocolVariant::Igd2WanPppConnection1.priority()
        );
        assert_eq!(
            ProtocolVariant::Igd1WanPppConnection1.generation().device_urn(),
            "urn:schemas-upnp-org:device:InternetGatewayDevice:1"
        );
    }

    #[test]
    fn test_service_object_from_toml() {
        let service: ServiceObject = toml::from_str(
            r#"
namespace = "media"
name = "plex"
type = "LoadBalancer"
load_balancer_ips = ["192.168.1.240"]

[annotations]
"holepunch/punch-external" = "true"

[[ports]]
port = 32400

[[ports]]
port = 1900
protocol = "UDP"
"#,
        )
        .unwrap();
        assert_eq!(service.service_type, ServiceType::LoadBalancer);
        assert_eq!(service.ports[0].protocol, "TCP");
        assert_eq!(service.ports[1], ServicePort::udp(1900));
    }
}
