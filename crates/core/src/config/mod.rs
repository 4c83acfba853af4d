//! 配置管理
//!
//! 配置从 TOML 文件加载，再由 `QUEUER_` 前缀的环境变量覆盖，
//! 嵌套字段使用 `__` 分隔，例如 `QUEUER_WORKER__CONCURRENCY=4`。
//!
//! ```rust,no_run
//! use queuer_core::config::AppConfig;
//!
//! let config = AppConfig::load(Some("config/queuer.toml")).expect("加载配置失败");
//! println!("worker并发数: {}", config.worker.concurrency);
//! ```

pub mod models;

pub use models::{
    AppConfig, DatabaseConfig, ObservabilityConfig, RedisConfig, SchedulerConfig, TaskSchemas,
    WorkerConfig, WorkerTaskConfig,
};
