use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    observability::ObservabilityConfig,
    redis::RedisConfig,
    scheduler_worker::{SchedulerConfig, WorkerConfig},
};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "QUEUER";

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序：
    /// 1. 默认配置
    /// 2. 配置文件（TOML 格式）
    /// 3. 环境变量覆盖（前缀 `QUEUER_`，层级分隔符 `__`）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/queuer.toml", "queuer.toml", "/etc/queuer/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(*path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = ConfigBuilder::builder()
            .add_source(File::from_str(toml_str, FileFormat::Toml))
            .build()
            .context("解析TOML配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.redis.validate().context("Redis配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const SAMPLE: &str = r#"
[database]
url = "postgresql://db/queuer"

[redis]
host = "redis"
max_stream_length = 500

[scheduler]
cron = "*/5 * * * *"
name_filter = "report_%"

[worker]
concurrency = 3

[[worker.tasks]]
name = "enrich"
queue = "orders"
handler = "log"
concurrency = 8

[worker.tasks.schemas.payload]
type = "object"
required = ["id"]

[[worker.tasks]]
name = "audit"
handler = "http"
"#;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.concurrency, 1);
        assert_eq!(config.scheduler.cron, "* * * * *");
        assert_eq!(config.redis.max_stream_length, 10000);
    }

    #[test]
    fn test_from_toml() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.database.url, "postgresql://db/queuer");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.redis.host, "redis");
        assert_eq!(config.redis.max_stream_length, 500);
        assert_eq!(config.scheduler.name_filter.as_deref(), Some("report_%"));
        assert_eq!(config.worker.tasks.len(), 2);

        let enrich = &config.worker.tasks[0];
        assert_eq!(enrich.stream(), "orders-enrich");
        assert_eq!(config.worker.concurrency_for(enrich), 8);
        assert_eq!(
            enrich.schemas.payload,
            Some(json!({"type": "object", "required": ["id"]}))
        );

        let audit = &config.worker.tasks[1];
        assert_eq!(audit.stream(), "audit");
        assert_eq!(config.worker.concurrency_for(audit), 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = AppConfig::from_toml("[database]\nurl = \"mysql://x\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.scheduler.cron, "*/5 * * * *");

        assert!(AppConfig::load(Some("/nonexistent/queuer.toml")).is_err());
    }
}
