use crate::adapters::igd::DiscoveryMode;
use crate::core::controller::ControllerSettings;
use crate::core::reconciler::LeasePolicy;
use crate::utils::error::{HolepunchError, Result};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HolepunchConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// 固定的 gateway 描述檔 URL，設定後不做 multicast 探索
    pub descriptor_url: Option<String>,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_duration")]
    pub duration_seconds: u64,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_manifest")]
    pub manifest: String,
    #[serde(default = "default_resync")]
    pub resync_seconds: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub verbose: bool,
}

fn default_discovery_timeout() -> u64 {
    3
}

fn default_request_timeout() -> u64 {
    10
}

fn default_lease_duration() -> u64 {
    3600
}

fn default_refresh_margin() -> u64 {
    30
}

fn default_manifest() -> String {
    "services.toml".to_string()
}

fn default_resync() -> u64 {
    60
}

fn default_retry_delay() -> u64 {
    5
}

fn default_max_retry_delay() -> u64 {
    300
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            descriptor_url: None,
            discovery_timeout_seconds: default_discovery_timeout(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_seconds: default_lease_duration(),
            refresh_margin_seconds: default_refresh_margin(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            resync_seconds: default_resync(),
            retry_delay_seconds: default_retry_delay(),
            max_retry_delay_seconds: default_max_retry_delay(),
        }
    }
}

/// 替換環境變數 (例如 ${ROUTER_IP})，未定義的保持原樣
pub fn substitute_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| HolepunchError::ConfigError {
        message: format!("invalid substitution pattern: {}", e),
    })?;

    let result = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    });

    Ok(result.to_string())
}

impl HolepunchConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = substitute_env_vars(content)?;
        Ok(toml::from_str(&processed_content)?)
    }

    /// 依設定選擇探索模式
    pub fn discovery_mode(&self) -> Result<DiscoveryMode> {
        match &self.gateway.descriptor_url {
            Some(url) => Ok(DiscoveryMode::Fixed(validation::validate_descriptor_url(
                "gateway.descriptor_url",
                url,
            )?)),
            None => Ok(DiscoveryMode::Multicast {
                window: Duration::from_secs(self.gateway.discovery_timeout_seconds),
            }),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.request_timeout_seconds)
    }

    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            duration: Duration::from_secs(self.lease.duration_seconds),
            refresh_margin: Duration::from_secs(self.lease.refresh_margin_seconds),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            resync_interval: Duration::from_secs(self.controller.resync_seconds),
            retry_delay: Duration::from_secs(self.controller.retry_delay_seconds),
            max_retry_delay: Duration::from_secs(self.controller.max_retry_delay_seconds),
        }
    }
}

impl Validate for HolepunchConfig {
    fn validate(&self) -> Result<()> {
        if let Some(url) = &self.gateway.descriptor_url {
            validation::validate_descriptor_url("gateway.descriptor_url", url)?;
        }
        validation::validate_positive_number(
            "gateway.discovery_timeout_seconds",
            self.gateway.discovery_timeout_seconds,
            1,
        )?;
        validation::validate_positive_number(
            "gateway.request_timeout_seconds",
            self.gateway.request_timeout_seconds,
            1,
        )?;

        // 租約以 u32 秒數送給 gateway
        validation::validate_range(
            "lease.duration_seconds",
            self.lease.duration_seconds,
            1,
            u64::from(u32::MAX),
        )?;
        validation::validate_range(
            "lease.refresh_margin_seconds",
            self.lease.refresh_margin_seconds,
            0,
            self.lease.duration_seconds - 1,
        )?;

        validation::validate_path("controller.manifest", &self.controller.manifest)?;
        validation::validate_positive_number("controller.resync_seconds", self.controller.resync_seconds, 1)?;
        validation::validate_positive_number(
            "controller.retry_delay_seconds",
            self.controller.retry_delay_seconds,
            1,
        )?;
        validation::validate_positive_number(
            "controller.max_retry_delay_seconds",
            self.controller.max_retry_delay_seconds,
            self.controller.retry_delay_seconds,
        )?;

        Ok(())
    }
}
