use async_trait::async_trait;

use crate::QueuerResult;

/// 任务 Worker 生命周期接口
///
/// 调度器持有已注册的 Worker，统一启动和停止。
#[async_trait]
pub trait TaskWorker: Send + Sync {
    /// Worker 标识，即消费的 Stream 名称
    fn name(&self) -> &str;

    /// 创建消费者组并开始读取循环
    async fn start(&self) -> QueuerResult<()>;

    /// 停止读取新条目，等待进行中的条目处理完毕
    async fn stop(&self) -> QueuerResult<()>;

    /// 当前正在处理的条目数
    fn in_flight(&self) -> usize;
}
