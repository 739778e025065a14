use thiserror::Error;

#[derive(Error, Debug)]
pub enum HolepunchError {
    #[error("Invalid port mapping annotation {key}={value}: {reason}")]
    ParseError {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Holepunch enabled on non-LoadBalancer service (type {service_type})")]
    NotLoadBalancer { service_type: String },

    #[error("Service has no load balancer IPv4 address allocated yet")]
    NoIpAllocatedYet,

    #[error("No UPnP gateway found on the network{}", format_discovery_errors(.errors))]
    NoGatewayFound { errors: Vec<String> },

    #[error("Unsupported protocol {protocol} on port {port}; only TCP and UDP can be forwarded")]
    UnsupportedProtocol { port: u16, protocol: String },

    #[error("Failed to forward {protocol} port {internal_port} -> {external_port}: {source}")]
    PortForwardFailed {
        internal_port: u16,
        external_port: u16,
        protocol: String,
        #[source]
        source: Box<HolepunchError>,
    },

    #[error("Gateway rejected {action}: UPnP error {code} ({description})")]
    SoapFault {
        action: String,
        code: u16,
        description: String,
    },

    #[error("Gateway returned HTTP {status} for {action}")]
    GatewayHttpError { action: String, status: u16 },

    #[error("Invalid gateway response: {message}")]
    InvalidGatewayResponse { message: String },

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid configuration value for {field} ({value}): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },
}

fn format_discovery_errors(errors: &[String]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!(" (discovery errors: {})", errors.join("; "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 服務註解或設定錯誤，需要人工修正
    Configuration,
    /// 暫時性狀態，預期會自行恢復
    Transient,
    /// 網路環境問題（找不到 gateway）
    Environment,
    /// gateway 呼叫失敗
    Device,
    /// 本地 IO 或關機
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl HolepunchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            HolepunchError::ParseError { .. }
            | HolepunchError::NotLoadBalancer { .. }
            | HolepunchError::UnsupportedProtocol { .. }
            | HolepunchError::TomlError(_)
            | HolepunchError::UrlError(_)
            | HolepunchError::ConfigError { .. }
            | HolepunchError::MissingConfigError { .. }
            | HolepunchError::InvalidConfigValueError { .. } => ErrorCategory::Configuration,
            HolepunchError::NoIpAllocatedYet => ErrorCategory::Transient,
            HolepunchError::NoGatewayFound { .. } => ErrorCategory::Environment,
            HolepunchError::PortForwardFailed { source, .. } => source.category(),
            HolepunchError::SoapFault { .. }
            | HolepunchError::GatewayHttpError { .. }
            | HolepunchError::InvalidGatewayResponse { .. }
            | HolepunchError::HttpError(_) => ErrorCategory::Device,
            HolepunchError::IoError(_)
            | HolepunchError::JsonError(_)
            | HolepunchError::Cancelled => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Transient => ErrorSeverity::Low,
            ErrorCategory::Environment | ErrorCategory::Device => ErrorSeverity::Medium,
            ErrorCategory::Configuration => ErrorSeverity::High,
            ErrorCategory::System => ErrorSeverity::Critical,
        }
    }

    /// Whether the dispatcher should retry with backoff rather than wait for an operator fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            HolepunchError::Cancelled => false,
            _ => !matches!(self.category(), ErrorCategory::Configuration),
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            HolepunchError::ParseError { key, .. } => format!(
                "Fix the annotation '{}': both the port suffix and the value must be numbers between 0 and 65535",
                key
            ),
            HolepunchError::NotLoadBalancer { .. } => {
                "Change the service type to LoadBalancer or remove the holepunch/punch-external annotation".to_string()
            }
            HolepunchError::NoIpAllocatedYet => {
                "Wait for the load balancer to allocate an address; the service will be retried".to_string()
            }
            HolepunchError::NoGatewayFound { .. } => {
                "Check that the router has UPnP IGD enabled, or configure gateway.descriptor_url".to_string()
            }
            HolepunchError::UnsupportedProtocol { .. } => {
                "Only TCP and UDP ports can be forwarded; remove the annotation or the port".to_string()
            }
            HolepunchError::PortForwardFailed { source, .. } => source.recovery_suggestion(),
            HolepunchError::SoapFault { code: 718, .. } => {
                "The external port is already mapped to another host; choose a different holepunch.port/ remap".to_string()
            }
            HolepunchError::SoapFault { code: 725, .. } => {
                "The router only accepts permanent leases; timed lease refresh cannot work with this device".to_string()
            }
            HolepunchError::SoapFault { .. }
            | HolepunchError::GatewayHttpError { .. }
            | HolepunchError::InvalidGatewayResponse { .. }
            | HolepunchError::HttpError(_) => {
                "Check the router's UPnP settings and network connectivity".to_string()
            }
            HolepunchError::IoError(_) => "Check file permissions and network interfaces".to_string(),
            HolepunchError::UrlError(_) => "Check configured URLs for typos".to_string(),
            HolepunchError::TomlError(_) => "Check the TOML syntax of the file".to_string(),
            HolepunchError::JsonError(_) => "Check the report path and disk space".to_string(),
            HolepunchError::Cancelled => "No action needed".to_string(),
            HolepunchError::ConfigError { .. }
            | HolepunchError::MissingConfigError { .. }
            | HolepunchError::InvalidConfigValueError { .. } => {
                "Review the configuration file and command line flags".to_string()
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Transient => format!("Not ready yet: {}", self),
            ErrorCategory::Environment => format!("Network problem: {}", self),
            ErrorCategory::Device => format!("Router problem: {}", self),
            ErrorCategory::System => format!("System error: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, HolepunchError>;
