use std::sync::{Arc, Mutex};
use std::time::Duration;

use queuer_core::{config::RedisConfig, QueuerError, QueuerResult};
use redis::{Client, Connection, RedisError};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::metrics_collector::RedisStreamMetrics;

/// 空闲连接池上限
const MAX_IDLE_CONNECTIONS: usize = 8;

/// 将Redis错误映射为系统错误
///
/// 连接类错误映射为 `ConnectionClosed`，调用方据此等待重连。
pub fn map_redis_error(e: RedisError) -> QueuerError {
    if is_connection_error(&e) {
        QueuerError::ConnectionClosed(e.to_string())
    } else {
        QueuerError::MessageQueue(format!("Redis命令执行失败: {e}"))
    }
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error() || e.is_connection_refusal() || e.is_timeout()
}

/// Redis连接管理器
///
/// 命令在阻塞线程池中通过同步连接执行，连接用完后归还空闲池。
/// 出现连接类错误的连接直接丢弃。
pub struct RedisConnectionManager {
    client: Client,
    config: RedisConfig,
    metrics: Arc<RedisStreamMetrics>,
    idle: Arc<Mutex<Vec<Connection>>>,
}

impl RedisConnectionManager {
    pub fn new(config: RedisConfig, metrics: Arc<RedisStreamMetrics>) -> QueuerResult<Self> {
        let client = Client::open(config.build_url()).map_err(|e| {
            QueuerError::MessageQueue(format!("创建Redis客户端失败: {e}"))
        })?;
        Ok(Self {
            client,
            config,
            metrics,
            idle: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// 创建并确认连接可用
    pub async fn connect(config: RedisConfig, metrics: Arc<RedisStreamMetrics>) -> QueuerResult<Self> {
        let manager = Self::new(config, metrics)?;
        manager.ping().await?;
        info!(
            "已连接Redis: {}:{}/{}",
            manager.config.host, manager.config.port, manager.config.database
        );
        Ok(manager)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// 执行命令
    pub async fn execute<T>(&self, cmd: redis::Cmd) -> QueuerResult<T>
    where
        T: redis::FromRedisValue + Send + 'static,
    {
        self.execute_with_timeout(cmd, None).await
    }

    /// 执行命令，`read_timeout` 用于阻塞类命令
    pub async fn execute_with_timeout<T>(
        &self,
        cmd: redis::Cmd,
        read_timeout: Option<Duration>,
    ) -> QueuerResult<T>
    where
        T: redis::FromRedisValue + Send + 'static,
    {
        let client = self.client.clone();
        let idle = self.idle.clone();
        let connect_timeout = Duration::from_secs(self.config.connection_timeout_seconds);

        let result = tokio::task::spawn_blocking(move || -> Result<T, RedisError> {
            let pooled = idle.lock().ok().and_then(|mut conns| conns.pop());
            let mut conn = match pooled {
                Some(conn) => conn,
                None => client.get_connection_with_timeout(connect_timeout)?,
            };
            conn.set_read_timeout(read_timeout)?;

            let result = cmd.query::<T>(&mut conn);
            let reusable = match &result {
                Ok(_) => true,
                Err(e) => !is_connection_error(e),
            };
            if reusable {
                if let Ok(mut conns) = idle.lock() {
                    if conns.len() < MAX_IDLE_CONNECTIONS {
                        conns.push(conn);
                    }
                }
            }
            result
        })
        .await
        .map_err(|e| QueuerError::Internal(format!("Redis命令任务异常终止: {e}")))?;

        result.map_err(|e| {
            if is_connection_error(&e) {
                self.metrics.record_connection_error();
                self.clear_idle();
            }
            map_redis_error(e)
        })
    }

    fn clear_idle(&self) {
        if let Ok(mut conns) = self.idle.lock() {
            conns.clear();
        }
    }

    pub async fn ping(&self) -> QueuerResult<()> {
        let response: String = self.execute(redis::cmd("PING")).await?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(QueuerError::MessageQueue(format!(
                "PING返回异常: {response}"
            )))
        }
    }

    /// 等待连接恢复
    ///
    /// 按 `reconnect_interval_ms` 周期性 PING，直到成功。
    pub async fn wait_until_connected(&self) -> QueuerResult<()> {
        let interval = Duration::from_millis(self.config.reconnect_interval_ms);
        let mut attempts = 0u64;
        loop {
            match self.ping().await {
                Ok(()) => {
                    if attempts > 0 {
                        info!("Redis连接已恢复，共尝试 {} 次", attempts + 1);
                    }
                    return Ok(());
                }
                Err(e) if e.is_connection_closed() => {
                    if attempts == 0 {
                        warn!("Redis连接不可用，等待恢复: {}", e);
                    } else {
                        debug!("Redis仍不可用 (第 {} 次): {}", attempts + 1, e);
                    }
                    attempts += 1;
                    sleep(interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
