pub mod app_config;
pub mod database;
pub mod observability;
pub mod redis;
pub mod scheduler_worker;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use observability::ObservabilityConfig;
pub use redis::RedisConfig;
pub use scheduler_worker::{SchedulerConfig, TaskSchemas, WorkerConfig, WorkerTaskConfig};
