use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use queuer_core::{models::TriggerMessage, traits::TriggerChannel, QueuerError, QueuerResult};
use redis::Client;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::redis_stream::RedisConnectionManager;

const SUBSCRIPTION_BUFFER: usize = 256;

/// 基于 Redis Pub/Sub 的触发通道
///
/// 订阅由后台任务转发到有界通道，连接断开后按重连间隔重新订阅。
pub struct RedisTriggerChannel {
    connection_manager: Arc<RedisConnectionManager>,
    channel: String,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl RedisTriggerChannel {
    pub fn new(connection_manager: Arc<RedisConnectionManager>, channel: impl Into<String>) -> Self {
        Self {
            connection_manager,
            channel: channel.into(),
            forwarder: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn forward(
        client: Client,
        channel: String,
        reconnect_interval: Duration,
        tx: mpsc::Sender<TriggerMessage>,
    ) {
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => match pubsub.subscribe(&channel).await {
                    Ok(()) => {
                        info!("已订阅触发通道: {}", channel);
                        let mut messages = pubsub.on_message();
                        while let Some(msg) = messages.next().await {
                            let payload: String = match msg.get_payload() {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!("读取触发消息失败: {}", e);
                                    continue;
                                }
                            };
                            match serde_json::from_str::<TriggerMessage>(&payload) {
                                Ok(message) => {
                                    if tx.send(message).await.is_err() {
                                        debug!("订阅接收端已关闭，停止转发");
                                        return;
                                    }
                                }
                                Err(e) => warn!("忽略无法解析的触发消息 {}: {}", payload, e),
                            }
                        }
                        warn!("触发通道订阅连接断开: {}", channel);
                    }
                    Err(e) => warn!("订阅触发通道 {} 失败: {}", channel, e),
                },
                Err(e) => warn!("建立订阅连接失败: {}", e),
            }

            if tx.is_closed() {
                return;
            }
            sleep(reconnect_interval).await;
        }
    }
}

#[async_trait]
impl TriggerChannel for RedisTriggerChannel {
    async fn publish(&self, message: &TriggerMessage) -> QueuerResult<()> {
        let body = serde_json::to_string(message)?;
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(&self.channel).arg(body);
        let receivers: i64 = self
            .connection_manager
            .execute(cmd)
            .await
            .map_err(|e| QueuerError::Trigger(format!("发布触发消息失败: {e}")))?;
        debug!("触发消息已发布到 {}，接收者 {} 个", self.channel, receivers);
        Ok(())
    }

    async fn subscribe(&self) -> QueuerResult<mpsc::Receiver<TriggerMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let client = self.connection_manager.client().clone();
        let interval =
            Duration::from_millis(self.connection_manager.config().reconnect_interval_ms);

        let handle = tokio::spawn(Self::forward(client, self.channel.clone(), interval, tx));
        if let Some(previous) = self.forwarder.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn unsubscribe(&self) -> QueuerResult<()> {
        if let Some(handle) = self.forwarder.lock().await.take() {
            handle.abort();
            info!("已取消订阅触发通道: {}", self.channel);
        }
        Ok(())
    }
}
