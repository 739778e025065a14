use clap::Parser;
use holepunch::core::annotations::parse_intent;
use holepunch::core::forwarder::build_request;
use holepunch::core::reconciler::forward_description;
use holepunch::core::report::RunReport;
use holepunch::domain::model::{ReconcileOutcome, ServiceType};
use holepunch::utils::error::ErrorSeverity;
use holepunch::utils::{logger, validation::Validate};
use holepunch::{
    CliArgs, Controller, HolepunchConfig, HolepunchError, IgdDiscovery, ManifestStore, Reconciler,
};
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // 載入 TOML 配置，預設檔案不存在時使用預設值
    let config_missing = !Path::new(&args.config).exists();
    let mut config = if config_missing && args.config == "holepunch.toml" {
        HolepunchConfig::default()
    } else {
        match HolepunchConfig::from_file(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("❌ Failed to load config file '{}': {}", args.config, e);
                eprintln!("💡 {}", e.recovery_suggestion());
                std::process::exit(1);
            }
        }
    };

    // 應用命令列覆蓋設定
    args.apply_overrides(&mut config);

    // 初始化日誌
    if config.logging.json {
        logger::init_json_logger(config.logging.verbose);
    } else {
        logger::init_cli_logger(config.logging.verbose);
    }

    tracing::info!("🚀 Starting holepunch");
    if config_missing {
        tracing::info!("No config file at {}, using defaults", args.config);
    }
    tracing::debug!("Config: {:?}", config);

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    let store = ManifestStore::new(&config.controller.manifest);

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - no gateway will be contacted");
        perform_dry_run(&store, &config).await?;
        return Ok(());
    }

    let discovery = IgdDiscovery::new(config.discovery_mode()?, config.request_timeout())?;
    tracing::info!("📡 Gateway discovery: {:?}", discovery.mode());

    let reconciler = Reconciler::new(store, discovery, config.lease_policy());
    let controller = Controller::new(reconciler, config.controller_settings());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    if args.once {
        let outcomes = match controller.run_once(&cancel).await {
            Ok(outcomes) => outcomes,
            Err(e) => exit_with(&e),
        };

        let mut worst: Option<ErrorSeverity> = None;
        for (key, outcome) in &outcomes {
            match outcome {
                ReconcileOutcome::Applied {
                    mappings,
                    external_ip,
                    ..
                } => {
                    let external = external_ip
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!("✅ {}: {} ports forwarded (external IP {})", key, mappings, external);
                }
                ReconcileOutcome::Skipped { reason } => println!("⏭️  {}: {}", key, reason),
                ReconcileOutcome::Failed(e) => {
                    eprintln!("❌ {}: {}", key, e.user_friendly_message());
                    eprintln!("💡 建議: {}", e.recovery_suggestion());
                    worst = worst.max(Some(e.severity()));
                }
            }
        }

        if let Some(path) = &args.report {
            let report = RunReport::from_outcomes(&outcomes);
            match report.write_to(path).await {
                Ok(()) => tracing::info!("📝 Report written to {}", path),
                Err(e) => exit_with(&e),
            }
        }

        // 根據錯誤嚴重程度決定退出碼
        let exit_code = match worst {
            None | Some(ErrorSeverity::Low) => 0, // 尚未就緒，下次再試
            Some(ErrorSeverity::Medium) => 2,      // 可重試錯誤
            Some(ErrorSeverity::High) => 1,        // 設定錯誤
            Some(ErrorSeverity::Critical) => 3,    // 系統錯誤
        };
        if exit_code > 0 {
            std::process::exit(exit_code);
        }
        return Ok(());
    }

    controller.run(cancel).await?;
    tracing::info!("👋 holepunch stopped");
    Ok(())
}

fn exit_with(e: &HolepunchError) -> ! {
    tracing::error!("❌ {}", e);
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());
    std::process::exit(1);
}

async fn perform_dry_run(store: &ManifestStore, config: &HolepunchConfig) -> anyhow::Result<()> {
    let services = store.load().await?;
    let lease = config.lease_policy();

    println!("📋 Dry Run Analysis ({} services):", services.len());
    println!(
        "  Lease: {}s, refreshed every {}s",
        lease.duration.as_secs(),
        lease.requeue_after().as_secs()
    );
    match &config.gateway.descriptor_url {
        Some(url) => println!("  Gateway: {}", url),
        None => println!("  Gateway: SSDP multicast discovery"),
    }
    println!();

    for service in &services {
        let key = service.key();
        let intent = match parse_intent(&service.annotations) {
            Ok(intent) => intent,
            Err(e) => {
                println!("❌ {}: {}", key, e);
                continue;
            }
        };

        if !intent.opted_in {
            println!("⏭️  {}: not opted in", key);
            continue;
        }
        if service.service_type != ServiceType::LoadBalancer {
            println!("❌ {}: type {} is not LoadBalancer", key, service.service_type);
            continue;
        }
        let Some(internal_client) = service.ingress_ipv4() else {
            println!("⏳ {}: no load balancer IPv4 address yet", key);
            continue;
        };

        println!("🔓 {} -> {}", key, internal_client);
        let description = forward_description(&key);
        for port in &service.ports {
            match build_request(internal_client, port, &intent, &description, lease.duration) {
                Ok(request) => println!(
                    "  {} {} -> {}:{}",
                    request.protocol, request.external_port, internal_client, request.internal_port
                ),
                Err(e) => {
                    println!("  ❌ {}", e);
                    break;
                }
            }
        }
    }

    println!();
    println!("✅ Dry run analysis complete.");
    Ok(())
}
