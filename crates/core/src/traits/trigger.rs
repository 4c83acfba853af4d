use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{models::TriggerMessage, QueuerResult};

/// 触发通道（发布/订阅）
///
/// 同一通道既承载临时运行请求，也承载运行完成后的下游触发。
#[async_trait]
pub trait TriggerChannel: Send + Sync {
    async fn publish(&self, message: &TriggerMessage) -> QueuerResult<()>;

    /// 订阅通道，消息通过有界通道交付
    async fn subscribe(&self) -> QueuerResult<mpsc::Receiver<TriggerMessage>>;

    /// 取消订阅，之前返回的接收端随之关闭
    async fn unsubscribe(&self) -> QueuerResult<()>;
}
