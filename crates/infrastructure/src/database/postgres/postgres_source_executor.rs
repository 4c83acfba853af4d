use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures::TryStreamExt;
use queuer_core::{
    models::SourceConnection,
    traits::{bind_params, SourceExecutor},
    QueuerError, QueuerResult,
};
use serde_json::Value;
use sqlx::{
    postgres::{PgArguments, PgPoolOptions},
    query::Query,
    PgPool, Postgres, Row,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument};

/// 基于 PostgreSQL 的数据源执行器
///
/// 每个 DSN 懒加载一个小连接池并复用。
pub struct PostgresSourceExecutor {
    pools: Mutex<HashMap<String, PgPool>>,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PostgresSourceExecutor {
    pub fn new(max_connections: u32, acquire_timeout: Duration) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            max_connections,
            acquire_timeout,
        }
    }

    async fn pool_for(&self, connection: &SourceConnection) -> QueuerResult<PgPool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&connection.dsn) {
            return Ok(pool.clone());
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&connection.dsn)
            .await
            .map_err(|e| {
                QueuerError::DatabaseOperation(format!(
                    "连接数据源 {} 失败: {}",
                    connection.name, e
                ))
            })?;
        info!("已连接数据源: {}", connection.name);
        pools.insert(connection.dsn.clone(), pool.clone());
        Ok(pool)
    }
}

impl Default for PostgresSourceExecutor {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(30))
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.clone()),
    }
}

#[async_trait]
impl SourceExecutor for PostgresSourceExecutor {
    #[instrument(skip(self, connection, query, params, sink), fields(connection = %connection.name))]
    async fn stream_rows(
        &self,
        connection: &SourceConnection,
        query: &str,
        params: &Value,
        sink: mpsc::Sender<Value>,
    ) -> QueuerResult<u64> {
        let pool = self.pool_for(connection).await?;
        let sql = format!("SELECT row_to_json(q)::jsonb AS row FROM ({query}) AS q");
        let values = bind_params(query, params);

        let mut statement = sqlx::query(&sql);
        for value in &values {
            statement = bind_value(statement, value);
        }

        let mut rows = statement.fetch(&pool);
        let mut sent = 0u64;
        while let Some(row) = rows.try_next().await? {
            let value: Value = row.try_get("row")?;
            if sink.send(value).await.is_err() {
                debug!("接收端已关闭，停止读取数据源");
                break;
            }
            sent += 1;
        }

        debug!("数据源 {} 共产出 {} 行", connection.name, sent);
        Ok(sent)
    }
}
