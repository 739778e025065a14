use crate::config::HolepunchConfig;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "holepunch")]
#[command(about = "Forwards router ports to annotated LoadBalancer services over UPnP")]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "holepunch.toml")]
    pub config: String,

    /// Service manifest, overrides controller.manifest
    #[arg(short, long)]
    pub manifest: Option<String>,

    /// Fixed gateway descriptor URL, disables multicast discovery
    #[arg(long)]
    pub gateway_url: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Reconcile every service once and exit
    #[arg(long)]
    pub once: bool,

    /// Write a JSON summary of the `--once` pass to this file
    #[arg(long, requires = "once")]
    pub report: Option<String>,

    /// Show planned port forwards without contacting a gateway
    #[arg(long)]
    pub dry_run: bool,
}

impl CliArgs {
    /// 命令列參數覆蓋設定檔
    pub fn apply_overrides(&self, config: &mut HolepunchConfig) {
        if let Some(manifest) = &self.manifest {
            config.controller.manifest = manifest.clone();
        }
        if let Some(url) = &self.gateway_url {
            config.gateway.descriptor_url = Some(url.clone());
        }
        if self.verbose {
            config.logging.verbose = true;
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let args = CliArgs::parse_from([
            "holepunch",
            "--manifest",
            "other.toml",
            "--gateway-url",
            "http://192.168.0.1:49000/igddesc.xml",
            "--json-logs",
        ]);
        let mut config = HolepunchConfig::default();
        args.apply_overrides(&mut config);

        assert_eq!(config.controller.manifest, "other.toml");
        assert_eq!(
            config.gateway.descriptor_url.as_deref(),
            Some("http://192.168.0.1:49000/igddesc.xml")
        );
        assert!(config.logging.json);
        assert!(!config.logging.verbose);
        assert_eq!(args.config, "holepunch.toml");
        assert!(args.report.is_none());
    }

    #[test]
    fn test_report_requires_once() {
        assert!(CliArgs::try_parse_from(["holepunch", "--report", "out.json"]).is_err());

        let args =
            CliArgs::try_parse_from(["holepunch", "--once", "--report", "out.json"]).unwrap();
        assert_eq!(args.report.as_deref(), Some("out.json"));
    }
}
