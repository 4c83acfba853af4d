use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use queuer_core::{
    models::{Delivery, StreamMessage},
    traits::{ReadRequest, StreamTransport},
    QueuerError, QueuerResult,
};
use tracing::{debug, instrument, warn};

use super::connection_manager::RedisConnectionManager;
use super::message_handler::{self, RawEntry, DATA_FIELD};
use super::metrics_collector::RedisStreamMetrics;

/// 阻塞读取时在 BLOCK 之外额外留给网络的读超时
const READ_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// 基于 Redis Stream 的传输实现
pub struct RedisStreamTransport {
    connection_manager: Arc<RedisConnectionManager>,
    metrics: Arc<RedisStreamMetrics>,
    max_stream_length: usize,
}

impl RedisStreamTransport {
    pub fn new(connection_manager: Arc<RedisConnectionManager>, metrics: Arc<RedisStreamMetrics>) -> Self {
        let max_stream_length = connection_manager.config().max_stream_length;
        Self {
            connection_manager,
            metrics,
            max_stream_length,
        }
    }

    pub fn metrics(&self) -> Arc<RedisStreamMetrics> {
        self.metrics.clone()
    }

    /// 把原始条目转换为投递，无法解析的条目直接确认并丢弃
    async fn into_deliveries(
        &self,
        stream: &str,
        group: &str,
        entries: Vec<RawEntry>,
    ) -> QueuerResult<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.decode() {
                Ok(message) => deliveries.push(Delivery {
                    xid: entry.xid,
                    stream: stream.to_string(),
                    message,
                }),
                Err(reason) => {
                    warn!("丢弃无法解析的条目 {} ({}): {}", entry.xid, stream, reason);
                    self.metrics.record_malformed();
                    self.ack(stream, group, &entry.xid).await?;
                }
            }
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl StreamTransport for RedisStreamTransport {
    #[instrument(skip(self))]
    async fn ensure_group(&self, stream: &str, group: &str) -> QueuerResult<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM");

        match self.connection_manager.execute::<String>(cmd).await {
            Ok(_) => {
                debug!("已创建消费者组: {} ({})", group, stream);
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("消费者组 {} 已存在", group);
                Ok(())
            }
            Err(e) if e.is_connection_closed() => Err(e),
            Err(e) => Err(QueuerError::MessageQueue(format!(
                "创建消费者组 {group} 失败: {e}"
            ))),
        }
    }

    async fn push(&self, stream: &str, message: &StreamMessage) -> QueuerResult<String> {
        let start = Instant::now();
        let body = message_handler::encode(message)?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_stream_length)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(body);
        let xid: String = self.connection_manager.execute(cmd).await?;

        self.metrics.record_pushed(stream);
        self.metrics
            .record_operation_duration("push", start.elapsed().as_millis() as f64);
        debug!("写入条目 {} 到 {}", xid, stream);
        Ok(xid)
    }

    async fn read_group(&self, request: &ReadRequest) -> QueuerResult<Vec<Delivery>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&request.group)
            .arg(&request.consumer)
            .arg("COUNT")
            .arg(request.count.max(1))
            .arg("BLOCK")
            .arg(request.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&request.stream)
            .arg(if request.pending { "0" } else { ">" });

        let reply: redis::Value = self
            .connection_manager
            .execute_with_timeout(cmd, Some(request.block + READ_TIMEOUT_MARGIN))
            .await?;

        let entries = message_handler::parse_read_reply(&reply, &request.stream);
        if !entries.is_empty() {
            self.metrics.record_delivered(&request.stream, entries.len());
        }
        self.into_deliveries(&request.stream, &request.group, entries)
            .await
    }

    #[instrument(skip(self))]
    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueuerResult<Vec<Delivery>> {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count.max(1));

        let reply: redis::Value = self.connection_manager.execute(cmd).await?;
        let entries = message_handler::parse_autoclaim_reply(&reply);
        if !entries.is_empty() {
            debug!("从 {} 回收 {} 个空闲条目", stream, entries.len());
            self.metrics.record_reclaimed(entries.len());
        }
        self.into_deliveries(stream, group, entries).await
    }

    async fn ack(&self, stream: &str, group: &str, xid: &str) -> QueuerResult<()> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group).arg(xid);
        let acked: i64 = self.connection_manager.execute(cmd).await?;
        if acked > 0 {
            self.metrics.record_acked();
        } else {
            debug!("条目 {} 已被确认过", xid);
        }
        Ok(())
    }

    async fn wait_until_connected(&self) -> QueuerResult<()> {
        self.connection_manager.wait_until_connected().await
    }

    async fn health_check(&self) -> QueuerResult<()> {
        self.connection_manager.ping().await
    }
}
