use std::time::Duration;

use async_trait::async_trait;

use crate::{
    models::{Delivery, StreamMessage},
    QueuerResult,
};

/// 消费者组读取请求
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub count: usize,
    /// 阻塞超时，必须是有限值
    pub block: Duration,
    /// 为 true 时读取本消费者已投递未确认的条目（id `0`），否则读取新条目（`>`）
    pub pending: bool,
}

/// Stream 传输抽象接口
///
/// 每个任务一个 Stream，通过持久消费者组消费，至少一次投递。
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// 创建消费者组（幂等），Stream 不存在时一并创建
    async fn ensure_group(&self, stream: &str, group: &str) -> QueuerResult<()>;

    /// 追加条目，按近似长度裁剪，返回条目 id
    async fn push(&self, stream: &str, message: &StreamMessage) -> QueuerResult<String>;

    /// 阻塞读取
    ///
    /// 连接断开时返回 `QueuerError::ConnectionClosed`。
    async fn read_group(&self, request: &ReadRequest) -> QueuerResult<Vec<Delivery>>;

    /// 将空闲超过 `min_idle` 的条目转移给指定消费者
    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueuerResult<Vec<Delivery>>;

    /// 确认条目
    async fn ack(&self, stream: &str, group: &str, xid: &str) -> QueuerResult<()>;

    /// 等待连接恢复
    async fn wait_until_connected(&self) -> QueuerResult<()>;

    async fn health_check(&self) -> QueuerResult<()>;
}
