use std::{sync::Arc, time::Duration};

use anyhow::Result;
use queuer_core::{
    config::DatabaseConfig,
    traits::{QueueRepository, RunRepository, SourceExecutor, TaskRunRepository},
};
use sqlx::PgPool;
use tracing::info;

use super::postgres::{
    PostgresQueueRepository, PostgresRunRepository, PostgresSourceExecutor,
    PostgresTaskRunRepository,
};

/// 数据库连接池管理器
pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    /// 创建新的数据库管理器
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.url)
            .await?;

        info!("数据库连接池已建立，最大连接数: {}", config.max_connections);
        Ok(Self { pool })
    }

    /// 包装已有连接池
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 获取数据库连接池
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 运行数据库迁移
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("数据库迁移完成");
        Ok(())
    }

    /// 检查数据库连接健康状态
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// 关闭数据库连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn queue_repository(&self) -> Arc<dyn QueueRepository> {
        Arc::new(PostgresQueueRepository::new(self.pool.clone()))
    }

    pub fn run_repository(&self) -> Arc<dyn RunRepository> {
        Arc::new(PostgresRunRepository::new(self.pool.clone()))
    }

    pub fn task_run_repository(&self) -> Arc<dyn TaskRunRepository> {
        Arc::new(PostgresTaskRunRepository::new(self.pool.clone()))
    }

    /// 数据源执行器，每个数据源连接池的大小与超时沿用主库配置
    pub fn source_executor(&self, config: &DatabaseConfig) -> Arc<dyn SourceExecutor> {
        Arc::new(PostgresSourceExecutor::new(
            config.max_connections.min(4),
            Duration::from_secs(config.connection_timeout_seconds),
        ))
    }
}
