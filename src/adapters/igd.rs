//! UPnP Internet Gateway Device control: descriptor parsing, SOAP calls, and the
//! discovery strategy that turns descriptor locations into gateway clients.

use crate::adapters::ssdp;
use crate::domain::model::{PortForwardRequest, ProtocolVariant};
use crate::domain::ports::{GatewayClient, GatewayDiscovery};
use crate::utils::error::{HolepunchError, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub service_type: String,
    pub control_url: String,
}

/// The parts of a root device description needed to reach its WAN services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub device_type: String,
    pub url_base: Option<String>,
    pub services: Vec<ServiceEntry>,
}

impl DeviceDescription {
    pub fn parse(xml: &str) -> Result<Self> {
        let device_type = element_text(xml, "deviceType").ok_or_else(|| {
            HolepunchError::InvalidGatewayResponse {
                message: "device description has no deviceType".to_string(),
            }
        })?;

        let url_base = element_text(xml, "URLBase").filter(|base| !base.is_empty());

        let services = elements(xml, "service")
            .into_iter()
            .filter_map(|block| {
                Some(ServiceEntry {
                    service_type: element_text(&block, "serviceType")?,
                    control_url: element_text(&block, "controlURL")?,
                })
            })
            .collect();

        Ok(Self {
            device_type,
            url_base,
            services,
        })
    }

    /// Control URLs of every service of `variant`, resolved against the base URL.
    pub fn control_urls(&self, variant: ProtocolVariant, location: &Url) -> Result<Vec<Url>> {
        if self.device_type != variant.generation().device_urn() {
            return Ok(vec![]);
        }

        let base = match &self.url_base {
            Some(base) => Url::parse(base)?,
            None => location.clone(),
        };

        self.services
            .iter()
            .filter(|service| service.service_type == variant.service_urn())
            .map(|service| base.join(&service.control_url).map_err(HolepunchError::from))
            .collect()
    }
}

fn element_pattern(tag: &str) -> Option<Regex> {
    let tag = regex::escape(tag);
    Regex::new(&format!(
        r"(?s)<(?:[\w-]+:)?{tag}(?:\s[^>]*)?>(.*?)</(?:[\w-]+:)?{tag}\s*>"
    ))
    .ok()
}

/// Text of the first `tag` element, namespace prefix ignored.
pub fn element_text(xml: &str, tag: &str) -> Option<String> {
    let captures = element_pattern(tag)?.captures(xml)?;
    Some(unescape_xml(captures.get(1)?.as_str().trim()))
}

fn elements(xml: &str, tag: &str) -> Vec<String> {
    match element_pattern(tag) {
        Some(re) => re
            .captures_iter(xml)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect(),
        None => Vec::new(),
    }
}

pub fn escape_xml(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn unescape_xml(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub fn soap_envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let body: String = args
        .iter()
        .map(|(name, value)| format!("<{name}>{}</{name}>", escape_xml(value)))
        .collect();

    format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{action} xmlns:u=\"{service_type}\">{body}</u:{action}></s:Body>\
         </s:Envelope>"
    )
}

/// One WAN connection service on a gateway.
#[derive(Debug, Clone)]
pub struct IgdClient {
    variant: ProtocolVariant,
    control_url: Url,
    http: Client,
}

impl IgdClient {
    pub fn new(variant: ProtocolVariant, control_url: Url, http: Client) -> Self {
        Self {
            variant,
            control_url,
            http,
        }
    }

    async fn call(
        &self,
        action: &str,
        args: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let service_type = self.variant.service_urn();
        let request = self
            .http
            .post(self.control_url.clone())
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{}#{}\"", service_type, action))
            .body(soap_envelope(service_type, action, args));

        tracing::trace!(action, url = %self.control_url, "SOAP request");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(HolepunchError::Cancelled),
            response = request.send() => response?,
        };
        let status = response.status();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(HolepunchError::Cancelled),
            body = response.text() => body?,
        };

        if !status.is_success() {
            // UPnP 錯誤以 SOAP fault 回傳，通常是 HTTP 500
            if let Some(code) = element_text(&body, "errorCode").and_then(|c| c.parse().ok()) {
                return Err(HolepunchError::SoapFault {
                    action: action.to_string(),
                    code,
                    description: element_text(&body, "errorDescription").unwrap_or_default(),
                });
            }
            return Err(HolepunchError::GatewayHttpError {
                action: action.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl GatewayClient for IgdClient {
    fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    fn control_url(&self) -> &str {
        self.control_url.as_str()
    }

    async fn add_port_mapping(
        &self,
        request: &PortForwardRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let args = [
            ("NewRemoteHost", request.remote_host.clone()),
            ("NewExternalPort", request.external_port.to_string()),
            ("NewProtocol", request.protocol.as_str().to_string()),
            ("NewInternalPort", request.internal_port.to_string()),
            ("NewInternalClient", request.internal_client.to_string()),
            ("NewEnabled", if request.enabled { "1" } else { "0" }.to_string()),
            ("NewPortMappingDescription", request.description.clone()),
            ("NewLeaseDuration", request.lease_duration_secs.to_string()),
        ];

        self.call("AddPortMapping", &args, cancel).await?;
        Ok(())
    }

    async fn get_external_ip_address(&self, cancel: &CancellationToken) -> Result<Ipv4Addr> {
        let body = self.call("GetExternalIPAddress", &[], cancel).await?;

        let raw = element_text(&body, "NewExternalIPAddress").ok_or_else(|| {
            HolepunchError::InvalidGatewayResponse {
                message: "GetExternalIPAddress response has no NewExternalIPAddress".to_string(),
            }
        })?;

        raw.parse()
            .map_err(|_| HolepunchError::InvalidGatewayResponse {
                message: format!("'{}' is not an IPv4 address", raw),
            })
    }
}

/// Where descriptor locations come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// SSDP search on the local segment, collecting answers for `window`.
    Multicast { window: Duration },
    /// A single configured descriptor URL, no multicast.
    Fixed(Url),
}

pub struct IgdDiscovery {
    mode: DiscoveryMode,
    http: Client,
}

impl IgdDiscovery {
    pub fn new(mode: DiscoveryMode, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { mode, http })
    }

    pub fn mode(&self) -> &DiscoveryMode {
        &self.mode
    }

    async fn locations(
        &self,
        variant: ProtocolVariant,
        cancel: &CancellationToken,
    ) -> Result<Vec<Url>> {
        match &self.mode {
            DiscoveryMode::Fixed(url) => Ok(vec![url.clone()]),
            DiscoveryMode::Multicast { window } => {
                ssdp::search(variant.generation().device_urn(), *window, cancel).await
            }
        }
    }

    async fn fetch_description(
        &self,
        location: &Url,
        cancel: &CancellationToken,
    ) -> Result<DeviceDescription> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(HolepunchError::Cancelled),
            response = self.http.get(location.clone()).send() => response?,
        };
        let response = response.error_for_status()?;
        let xml = tokio::select! {
            _ = cancel.cancelled() => return Err(HolepunchError::Cancelled),
            body = response.text() => body?,
        };
        DeviceDescription::parse(&xml)
    }
}

#[async_trait]
impl GatewayDiscovery for IgdDiscovery {
    async fn discover(
        &self,
        variant: ProtocolVariant,
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<dyn GatewayClient>>> {
        let locations = self.locations(variant, cancel).await?;

        let mut clients: Vec<Arc<dyn GatewayClient>> = Vec::new();
        let mut first_error = None;

        for location in locations {
            let urls = match self.fetch_description(&location, cancel).await {
                Ok(description) => description.control_urls(variant, &location),
                Err(e) => Err(e),
            };

            match urls {
                Ok(urls) => clients.extend(urls.into_iter().map(|url| {
                    Arc::new(IgdClient::new(variant, url, self.http.clone()))
                        as Arc<dyn GatewayClient>
                })),
                Err(HolepunchError::Cancelled) => return Err(HolepunchError::Cancelled),
                Err(e) => {
                    tracing::debug!(%variant, %location, error = %e, "Skipping unusable gateway descriptor");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) if clients.is_empty() => Err(e),
            _ => Ok(clients),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::TransportProtocol;
    use httpmock::prelude::*;

    const IGD1_DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <friendlyName>OpenWRT router</friendlyName>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <controlURL>/ctl/L3F</controlURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
            <serviceList>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
                <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
                <controlURL>/ctl/IPConn</controlURL>
                <eventSubURL>/evt/IPConn</eventSubURL>
              </service>
            </serviceList>
          </device>
        </deviceList>
      </device>
    </deviceList>
  </device>
</root>"#;

    #[test]
    fn test_parse_description() {
        let description = DeviceDescription::parse(IGD1_DESCRIPTION).unwrap();
        assert_eq!(
            description.device_type,
            "urn:schemas-upnp-org:device:InternetGatewayDevice:1"
        );
        assert_eq!(description.url_base, None);
        assert_eq!(description.services.len(), 2);
        assert_eq!(description.services[1].control_url, "/ctl/IPConn");
    }

    #[test]
    fn test_control_urls_filter_by_generation_and_service() {
        let description = DeviceDescription::parse(IGD1_DESCRIPTION).unwrap();
        let location = Url::parse("http://192.168.1.1:5000/rootDesc.xml").unwrap();

        let urls = description
            .control_urls(ProtocolVariant::Igd1WanIpConnection1, &location)
            .unwrap();
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].as_str(), "http://192.168.1.1:5000/ctl/IPConn");

        // IGD:2 的變體不應匹配 IGD:1 裝置
        assert!(description
            .control_urls(ProtocolVariant::Igd2WanIpConnection1, &location)
            .unwrap()
            .is_empty());
        assert!(description
            .control_urls(ProtocolVariant::Igd1WanPppConnection1, &location)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_url_base_takes_precedence() {
        let xml = IGD1_DESCRIPTION.replace(
            "<specVersion>",
            "<URLBase>http://10.0.0.1:49152/</URLBase><specVersion>",
        );
        let description = DeviceDescription::parse(&xml).unwrap();
        let location = Url::parse("http://192.168.1.1:5000/rootDesc.xml").unwrap();

        let urls = description
            .control_urls(ProtocolVariant::Igd1WanIpConnection1, &location)
            .unwrap();
        assert_eq!(urls[0].as_str(), "http://10.0.0.1:49152/ctl/IPConn");
    }

    #[test]
    fn test_description_without_device_type_is_rejected() {
        assert!(DeviceDescription::parse("<root><device></device></root>").is_err());
    }

    #[test]
    fn test_soap_envelope_escapes_arguments() {
        let envelope = soap_envelope(
            "urn:schemas-upnp-org:service:WANIPConnection:1",
            "AddPortMapping",
            &[("NewPortMappingDescription", "holepunch <a&b>".to_string())],
        );
        assert!(envelope.contains(
            "<u:AddPortMapping xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">"
        ));
        assert!(envelope.contains(
            "<NewPortMappingDescription>holepunch &lt;a&amp;b&gt;</NewPortMappingDescription>"
        ));
    }

    #[test]
    fn test_element_text_ignores_prefix_and_unescapes() {
        let body = "<s:Body><u:Resp><NewExternalIPAddress> 203.0.113.7 </NewExternalIPAddress>\
                    <m:Note xmlns:m=\"x\">a &amp; b</m:Note></u:Resp></s:Body>";
        assert_eq!(element_text(body, "NewExternalIPAddress").unwrap(), "203.0.113.7");
        assert_eq!(element_text(body, "Note").unwrap(), "a & b");
        assert!(element_text(body, "Missing").is_none());
    }

    fn client_for(server: &MockServer) -> IgdClient {
        IgdClient::new(
            ProtocolVariant::Igd1WanIpConnection1,
            Url::parse(&server.url("/ctl/IPConn")).unwrap(),
            Client::new(),
        )
    }

    #[tokio::test]
    async fn test_add_port_mapping_sends_soap_request() {
        let server = MockServer::start();
        let soap_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/ctl/IPConn")
                .header(
                    "SOAPAction",
                    "\"urn:schemas-upnp-org:service:WANIPConnection:1#AddPortMapping\"",
                )
                .body_contains("<NewRemoteHost></NewRemoteHost>")
                .body_contains("<NewExternalPort>3000</NewExternalPort>")
                .body_contains("<NewProtocol>TCP</NewProtocol>")
                .body_contains("<NewInternalPort>80</NewInternalPort>")
                .body_contains("<NewInternalClient>192.168.1.240</NewInternalClient>")
                .body_contains("<NewEnabled>1</NewEnabled>")
                .body_contains("<NewLeaseDuration>3600</NewLeaseDuration>");
            then.status(200)
                .header("Content-Type", "text/xml")
                .body("<s:Envelope><s:Body><u:AddPortMappingResponse/></s:Body></s:Envelope>");
        });

        let request = PortForwardRequest {
            remote_host: String::new(),
            external_port: 3000,
            protocol: TransportProtocol::Tcp,
            internal_port: 80,
            internal_client: Ipv4Addr::new(192, 168, 1, 240),
            enabled: true,
            description: "holepunch default/web".to_string(),
            lease_duration_secs: 3600,
        };

        client_for(&server)
            .add_port_mapping(&request, &CancellationToken::new())
            .await
            .unwrap();
        soap_mock.assert();
    }

    #[tokio::test]
    async fn test_soap_fault_is_decoded() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/ctl/IPConn");
            then.status(500).body(
                "<s:Envelope><s:Body><s:Fault><faultcode>s:Client</faultcode>\
                 <faultstring>UPnPError</faultstring><detail><UPnPError>\
                 <errorCode>718</errorCode><errorDescription>ConflictInMappingEntry</errorDescription>\
                 </UPnPError></detail></s:Fault></s:Body></s:Envelope>",
            );
        });

        let err = client_for(&server)
            .get_external_ip_address(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            HolepunchError::SoapFault {
                action,
                code,
                description,
            } => {
                assert_eq!(action, "GetExternalIPAddress");
                assert_eq!(code, 718);
                assert_eq!(description, "ConflictInMappingEntry");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plain_http_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/ctl/IPConn");
            then.status(404);
        });

        let err = client_for(&server)
            .get_external_ip_address(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HolepunchError::GatewayHttpError { status: 404, .. }
        ));
    }

    #[tokio::test]
    async fn test_get_external_ip_address() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/ctl/IPConn")
                .header(
                    "SOAPAction",
                    "\"urn:schemas-upnp-org:service:WANIPConnection:1#GetExternalIPAddress\"",
                );
            then.status(200).body(
                "<s:Envelope><s:Body><u:GetExternalIPAddressResponse>\
                 <NewExternalIPAddress>203.0.113.7</NewExternalIPAddress>\
                 </u:GetExternalIPAddressResponse></s:Body></s:Envelope>",
            );
        });

        let ip = client_for(&server)
            .get_external_ip_address(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 7));
    }

    #[tokio::test]
    async fn test_fixed_discovery_matches_only_the_device_generation() {
        let server = MockServer::start();
        let desc_mock = server.mock(|when, then| {
            when.method(GET).path("/rootDesc.xml");
            then.status(200).body(IGD1_DESCRIPTION);
        });

        let discovery = IgdDiscovery::new(
            DiscoveryMode::Fixed(Url::parse(&server.url("/rootDesc.xml")).unwrap()),
            Duration::from_secs(5),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let ip1 = discovery
            .discover(ProtocolVariant::Igd1WanIpConnection1, &cancel)
            .await
            .unwrap();
        assert_eq!(ip1.len(), 1);
        assert_eq!(ip1[0].control_url(), server.url("/ctl/IPConn"));

        let ig2 = discovery
            .discover(ProtocolVariant::Igd2WanIpConnection2, &cancel)
            .await
            .unwrap();
        assert!(ig2.is_empty());

        desc_mock.assert_hits(2);
    }

    #[tokio::test]
    async fn test_fixed_discovery_surfaces_fetch_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/rootDesc.xml");
            then.status(503);
        });

        let discovery = IgdDiscovery::new(
            DiscoveryMode::Fixed(Url::parse(&server.url("/rootDesc.xml")).unwrap()),
            Duration::from_secs(5),
        )
        .unwrap();

        let result = discovery
            .discover(ProtocolVariant::Igd1WanIpConnection1, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(HolepunchError::HttpError(_))));
    }
}
