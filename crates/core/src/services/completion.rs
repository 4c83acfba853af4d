use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::{
    models::{Run, TriggerMessage},
    traits::{QueueRepository, RunRepository, TriggerChannel},
    QueuerResult,
};

/// 运行实例完成通知
///
/// Worker 和生产者在可能导致运行实例结束的操作之后调用。
/// 只有认领成功的调用方才会向触发通道发布下游运行请求，
/// 因此并发的多个调用方中下游只被触发一次。
pub struct CompletionNotifier {
    queues: Arc<dyn QueueRepository>,
    runs: Arc<dyn RunRepository>,
    trigger: Arc<dyn TriggerChannel>,
}

impl CompletionNotifier {
    pub fn new(
        queues: Arc<dyn QueueRepository>,
        runs: Arc<dyn RunRepository>,
        trigger: Arc<dyn TriggerChannel>,
    ) -> Self {
        Self {
            queues,
            runs,
            trigger,
        }
    }

    /// 运行实例已结束时认领完成事件并触发下游队列
    ///
    /// `task_id` 为刚结算的任务，生产者调用时为空。
    /// 返回成功发布的触发消息数。发布失败只记录日志，不影响已持久化的结果。
    #[instrument(skip(self, run), fields(run_id = run.id))]
    pub async fn notify(&self, run: &Run, task_id: Option<i64>) -> QueuerResult<usize> {
        if !run.is_finished() {
            return Ok(0);
        }

        if !self.runs.claim_completion(run.id, task_id).await? {
            debug!("运行实例 {} 的完成事件已被认领", run.id);
            return Ok(0);
        }

        info!("运行实例 {} ({}) 已完成，状态: {}", run.id, run.name, run.status);
        metrics::counter!("queuer_runs_completed_total", "status" => run.status.as_str())
            .increment(1);

        let dependents = self.queues.get_dependents(run.queue_id).await?;
        let mut published = 0;
        for queue in dependents {
            let message = TriggerMessage::downstream(queue.id, run.id);
            match self.trigger.publish(&message).await {
                Ok(()) => {
                    info!("已触发下游队列 {} ({})", queue.id, queue.name);
                    published += 1;
                }
                Err(e) => {
                    error!("触发下游队列 {} 失败: {}", queue.name, e);
                    metrics::counter!("queuer_trigger_publish_failures_total").increment(1);
                }
            }
        }

        Ok(published)
    }
}
