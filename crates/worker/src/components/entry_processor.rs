use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use queuer_core::{
    models::{
        task_stream_name, Code, Delivery, StreamMessage, TaskOutcome, TaskRunOptions, TaskRunUnit,
        WorkUnit,
    },
    traits::{RunRepository, StreamTransport, TaskHandler, TaskRunRepository},
    CompletionNotifier, QueuerResult,
};

use super::schema_validator::SchemaValidator;

/// 单个 Stream 条目的处理流程
///
/// 顺序：解析 → 标记开始 → 校验 → 执行处理器 → 结算 → 推进任务链/触发下游 → 确认。
/// 确认总是在结果持久化之后，处理失败时条目留在待确认列表中等待重投递。
pub struct EntryProcessor {
    pub(crate) task_name: String,
    pub(crate) group: String,
    pub(crate) host: String,
    pub(crate) runs: Arc<dyn RunRepository>,
    pub(crate) task_runs: Arc<dyn TaskRunRepository>,
    pub(crate) transport: Arc<dyn StreamTransport>,
    pub(crate) notifier: Arc<CompletionNotifier>,
    pub(crate) handler: Arc<dyn TaskHandler>,
    pub(crate) validator: SchemaValidator,
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知异常".to_string()
    }
}

impl EntryProcessor {
    #[instrument(skip(self, delivery), fields(task = %self.task_name, xid = %delivery.xid))]
    pub async fn process(&self, delivery: &Delivery) -> QueuerResult<()> {
        match &delivery.message {
            StreamMessage::TaskRun { task_run_id } => {
                self.process_task_run(delivery, *task_run_id).await?
            }
            StreamMessage::Payload {
                queue_id,
                run_id,
                payload,
            } => {
                self.process_payload(delivery, *queue_id, *run_id, payload)
                    .await?
            }
        }
        self.ack(delivery).await
    }

    async fn ack(&self, delivery: &Delivery) -> QueuerResult<()> {
        self.transport
            .ack(&delivery.stream, &self.group, &delivery.xid)
            .await?;
        counter!("queuer_entries_acked_total", "task" => self.task_name.clone()).increment(1);
        Ok(())
    }

    async fn process_task_run(&self, delivery: &Delivery, task_run_id: i64) -> QueuerResult<()> {
        let Some(unit) = self.task_runs.get_unit(task_run_id).await? else {
            warn!("任务运行实例 {} 不存在，丢弃条目", task_run_id);
            return Ok(());
        };

        let Some(started) = self
            .task_runs
            .mark_started(task_run_id, &delivery.xid, &self.host)
            .await?
        else {
            return self.recover(&unit).await;
        };
        debug!("任务运行实例 {} 开始执行", task_run_id);

        let mut unit = unit;
        unit.task_run = started;
        let work = WorkUnit::from_task_run(&unit, &self.host, &delivery.xid);
        let outcome = self.execute(&work).await;
        let success = outcome.is_ok();

        let Some(run) = self.task_runs.settle(task_run_id, &outcome).await? else {
            debug!("任务运行实例 {} 已被结算", task_run_id);
            return Ok(());
        };

        if success {
            if let Some(next) = &unit.next {
                self.enqueue_next(&unit.run.name, next.id, &next.name).await?;
            }
        }
        self.notifier.notify(&run, Some(unit.task_run.task_id)).await?;
        Ok(())
    }

    /// 开始条件不满足时的处理
    ///
    /// 任务运行实例已成功结算但下一个任务尚未被认领，说明上次处理在推进任务链之前中断，
    /// 重新写入下一个任务；运行实例已结束时补发完成通知。
    /// 被其他条目认领的重复条目直接确认丢弃。
    async fn recover(&self, unit: &TaskRunUnit) -> QueuerResult<()> {
        let task_run = &unit.task_run;
        if task_run.code.is_pending() {
            info!(
                "任务运行实例 {} 已被其他条目 {:?} 认领，丢弃重复条目",
                task_run.id, task_run.xid
            );
            return Ok(());
        }

        debug!("任务运行实例 {} 已结算为 {}，检查后续步骤", task_run.id, task_run.code);
        if task_run.code == Code::Ok {
            if let Some(next) = &unit.next {
                if next.code.is_pending() && next.xid.is_none() {
                    warn!("任务运行实例 {} 的后续任务未推进，重新写入", task_run.id);
                    self.enqueue_next(&unit.run.name, next.id, &next.name).await?;
                }
            }
        }

        if let Some(run) = self.runs.get_by_id(unit.run.id).await? {
            self.notifier.notify(&run, Some(task_run.task_id)).await?;
        }
        Ok(())
    }

    async fn enqueue_next(&self, queue_name: &str, next_id: i64, next_name: &str) -> QueuerResult<()> {
        let stream = task_stream_name(queue_name, next_name);
        self.transport
            .push(&stream, &StreamMessage::task_run(next_id))
            .await?;
        counter!("queuer_entries_pushed_total", "stream" => stream.clone()).increment(1);
        debug!("任务运行实例 {} 已写入 {}", next_id, stream);
        Ok(())
    }

    async fn process_payload(
        &self,
        delivery: &Delivery,
        queue_id: i64,
        run_id: i64,
        payload: &Value,
    ) -> QueuerResult<()> {
        // 上次处理已记账但未确认，只补发完成通知
        if self.runs.entry_recorded(run_id, &delivery.xid).await? {
            info!("运行实例 {} 的条目 {} 已记账，跳过重复执行", run_id, delivery.xid);
            if let Some(run) = self.runs.get_by_id(run_id).await? {
                self.notifier.notify(&run, None).await?;
            }
            return Ok(());
        }

        let work = WorkUnit {
            run_id,
            queue_id,
            queue_name: delivery.stream.clone(),
            item_id: None,
            task_run_id: None,
            task_name: self.task_name.clone(),
            options: TaskRunOptions::new(),
            payload: payload.clone(),
            previous_result: None,
            host: self.host.clone(),
            xid: delivery.xid.clone(),
        };
        let outcome = self.execute(&work).await;
        if let Some(reason) = &outcome.reason {
            warn!("运行实例 {} 的条目 {} 处理失败: {}", run_id, delivery.xid, reason);
        }

        match self
            .runs
            .record_outcome(run_id, &delivery.xid, outcome.is_ok())
            .await?
        {
            Some(run) => {
                self.notifier.notify(&run, None).await?;
            }
            None => debug!("运行实例 {} 不再接受条目 {} 的结果", run_id, delivery.xid),
        }
        Ok(())
    }

    /// 校验并执行处理器，处理器的错误和异常都转换为失败结果
    async fn execute(&self, work: &WorkUnit) -> TaskOutcome {
        if let Err(reason) = self.validator.validate(work) {
            counter!("queuer_validation_failures_total", "task" => self.task_name.clone())
                .increment(1);
            return self.record(TaskOutcome::err(reason));
        }

        let start = Instant::now();
        let result = AssertUnwindSafe(self.handler.handle(work))
            .catch_unwind()
            .await;
        histogram!("queuer_handler_duration_seconds", "task" => self.task_name.clone())
            .record(start.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(Ok(value)) => TaskOutcome::ok(value),
            Ok(Err(e)) => TaskOutcome::err(e.to_string()),
            Err(panic) => {
                let message = panic_message(panic);
                error!("处理器异常: task={}, {}", self.task_name, message);
                TaskOutcome::err(format!("处理器异常: {message}"))
            }
        };
        self.record(outcome)
    }

    fn record(&self, outcome: TaskOutcome) -> TaskOutcome {
        counter!(
            "queuer_task_runs_total",
            "task" => self.task_name.clone(),
            "code" => outcome.code.as_str()
        )
        .increment(1);
        outcome
    }
}
