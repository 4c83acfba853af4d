use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use queuer::{AppMode, Application, ShutdownManager};
use queuer_core::{
    config::{AppConfig, ObservabilityConfig},
    models::TriggerMessage,
    traits::TriggerChannel,
};
use queuer_infrastructure::{RedisConnectionManager, RedisStreamMetrics, RedisTriggerChannel};
use queuer_worker::HandlerRegistry;
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn cli() -> Command {
    Command::new("queuer")
        .version(env!("CARGO_PKG_VERSION"))
        .about("队列编排系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .global(true),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["scheduler", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，默认取配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，默认取配置文件")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(
            Command::new("trigger")
                .about("通过触发通道请求一次队列运行")
                .arg(
                    Arg::new("name")
                        .long("name")
                        .value_name("NAME")
                        .help("队列名称")
                        .conflicts_with("id")
                        .required_unless_present("id"),
                )
                .arg(
                    Arg::new("id")
                        .long("id")
                        .value_name("ID")
                        .help("队列ID")
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    Arg::new("payload")
                        .long("payload")
                        .value_name("JSON")
                        .help("运行负载（JSON）"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path).context("加载配置失败")?;

    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.observability.log_level);
    let log_format = matches
        .get_one::<String>("log-format")
        .unwrap_or(&config.observability.log_format);
    init_logging(log_level, log_format)?;

    if let Some(trigger) = matches.subcommand_matches("trigger") {
        return publish_trigger(&config, trigger).await;
    }

    init_metrics(&config.observability)?;

    let mode = parse_app_mode(
        matches
            .get_one::<String>("mode")
            .map(String::as_str)
            .unwrap_or("all"),
        &config,
    )?;
    info!("启动队列编排系统，模式: {:?}", mode);

    let app = Arc::new(Application::new(config, mode, HandlerRegistry::with_builtin()).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {:#}", e);
            }
        })
    };

    queuer::shutdown::wait_for_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown();

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {}", e),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }
    Ok(())
}

/// 初始化日志系统，`RUST_LOG` 优先于参数
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        _ => return Err(anyhow::anyhow!("不支持的日志格式: {log_format}")),
    }
    Ok(())
}

/// 启用时安装 Prometheus 指标导出
fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }
    let addr: SocketAddr = config
        .metrics_bind
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus指标导出失败")?;
    info!("Prometheus指标导出已启动: {}", addr);
    Ok(())
}

fn parse_app_mode(mode: &str, config: &AppConfig) -> Result<AppMode> {
    match mode {
        "scheduler" => {
            if !config.scheduler.enabled {
                return Err(anyhow::anyhow!("调度器被禁用，请检查配置"));
            }
            Ok(AppMode::Scheduler)
        }
        "worker" => {
            if !config.worker.enabled {
                return Err(anyhow::anyhow!("Worker被禁用，请检查配置"));
            }
            Ok(AppMode::Worker)
        }
        "all" => Ok(AppMode::All),
        _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
    }
}

async fn publish_trigger(config: &AppConfig, matches: &ArgMatches) -> Result<()> {
    let payload = matches
        .get_one::<String>("payload")
        .map(|raw| serde_json::from_str::<Value>(raw))
        .transpose()
        .context("负载不是有效的JSON")?;
    let message = match (matches.get_one::<i64>("id"), matches.get_one::<String>("name")) {
        (Some(id), _) => TriggerMessage::by_id(*id, payload),
        (None, Some(name)) => TriggerMessage::by_name(name.clone(), payload),
        (None, None) => return Err(anyhow::anyhow!("必须指定 --name 或 --id")),
    };

    let redis = RedisConnectionManager::connect(
        config.redis.clone(),
        Arc::new(RedisStreamMetrics::default()),
    )
    .await
    .context("连接Redis失败")?;
    let channel = RedisTriggerChannel::new(Arc::new(redis), config.scheduler.trigger_channel.clone());
    channel.publish(&message).await?;
    info!("已发布触发请求到 {}: {:?}", channel.channel(), message);
    Ok(())
}
