use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use queuer_core::{
    models::{Queue, Run, StreamMessage, TaskOutcome, TaskRunTemplate},
    traits::{QueueRepository, RunRepository, SourceExecutor, StreamTransport, TaskRunRepository},
    CompletionNotifier, QueuerError, QueuerResult,
};

/// 数据源行的缓冲上限
pub const DEFAULT_ROW_BUFFER: usize = 64;

/// 运行实例生产者
///
/// 根据队列定义和触发负载创建运行实例，把条目逐个写入传输层。
/// 数据源查询按行流式读取，通道满时阻塞查询端。
pub struct QueueRunner {
    queues: Arc<dyn QueueRepository>,
    runs: Arc<dyn RunRepository>,
    task_runs: Arc<dyn TaskRunRepository>,
    transport: Arc<dyn StreamTransport>,
    source: Arc<dyn SourceExecutor>,
    notifier: Arc<CompletionNotifier>,
    row_buffer: usize,
}

impl QueueRunner {
    pub fn new(
        queues: Arc<dyn QueueRepository>,
        runs: Arc<dyn RunRepository>,
        task_runs: Arc<dyn TaskRunRepository>,
        transport: Arc<dyn StreamTransport>,
        source: Arc<dyn SourceExecutor>,
        notifier: Arc<CompletionNotifier>,
    ) -> Self {
        Self {
            queues,
            runs,
            task_runs,
            transport,
            source,
            notifier,
            row_buffer: DEFAULT_ROW_BUFFER,
        }
    }

    pub fn with_row_buffer(mut self, row_buffer: usize) -> Self {
        self.row_buffer = row_buffer.max(1);
        self
    }

    /// 执行一次队列运行
    ///
    /// 返回封存后的运行实例。数据源查询中途失败时停止生产，
    /// 但仍以已生产的条目数封存，保证运行实例能够结束。
    #[instrument(skip(self, queue, payload), fields(queue_id = queue.id, queue_name = %queue.name))]
    pub async fn run(&self, queue: &Queue, payload: Value) -> QueuerResult<Run> {
        let start = Instant::now();
        let run = self.runs.create(queue, &payload).await?;
        let templates: Vec<TaskRunTemplate> = queue.tasks.iter().map(TaskRunTemplate::from).collect();
        info!("队列 {} 开始运行，运行实例 {}", queue.name, run.id);

        let total = if queue.has_source() {
            self.produce_from_source(queue, &run, &templates, &payload)
                .await
        } else {
            if queue.query.is_some() {
                warn!("队列 {} 配置了查询但缺少数据源连接，使用触发负载作为条目", queue.name);
            }
            match self.produce_item(queue, &run, &templates, 1, payload).await {
                Ok(()) => 1,
                Err(e) => {
                    error!("队列 {} 生产条目失败: {}", queue.name, e);
                    0
                }
            }
        };

        let run = self.runs.finalize_total(run.id, total).await?;
        histogram!("queuer_run_production_duration_seconds", "queue" => queue.name.clone())
            .record(start.elapsed().as_secs_f64());
        info!(
            "队列 {} 运行实例 {} 生产完成，共 {} 个条目",
            queue.name, run.id, total
        );

        // 所有条目可能在封存前已处理完毕
        if let Err(e) = self.notifier.notify(&run, None).await {
            error!("运行实例 {} 完成通知失败: {}", run.id, e);
        }
        Ok(run)
    }

    async fn produce_from_source(
        &self,
        queue: &Queue,
        run: &Run,
        templates: &[TaskRunTemplate],
        payload: &Value,
    ) -> i64 {
        let (Some(query), Some(connection_id)) = (queue.query.as_deref(), queue.connection_id) else {
            return 0;
        };
        let connection = match self.queues.get_connection(connection_id).await {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                error!("队列 {} 的数据源连接 {} 不存在", queue.name, connection_id);
                return 0;
            }
            Err(e) => {
                error!("加载数据源连接 {} 失败: {}", connection_id, e);
                return 0;
            }
        };

        let (tx, rx) = mpsc::channel(self.row_buffer);
        let source = self.source.stream_rows(&connection, query, payload, tx);
        let consume = async move {
            let mut rx = rx;
            let mut total = 0i64;
            while let Some(row) = rx.recv().await {
                match self.produce_item(queue, run, templates, total + 1, row).await {
                    Ok(()) => total += 1,
                    Err(e) => {
                        error!("队列 {} 生产条目失败，停止生产: {}", queue.name, e);
                        break;
                    }
                }
            }
            total
        };

        let (source_result, total) = tokio::join!(source, consume);
        match source_result {
            Ok(rows) => debug!("数据源返回 {} 行，已生产 {} 个条目", rows, total),
            Err(e) => error!("队列 {} 查询执行失败，停止生产: {}", queue.name, e),
        }
        total
    }

    /// 生产单个条目
    ///
    /// 条目先计入总数再写入传输层，Worker 结算时总数一定已包含该条目。
    /// 写入失败时把条目结算为失败，运行实例仍能结束。
    /// 计入总数之后的错误只记录日志，返回 `Ok` 表示该条目已计数。
    /// `seq` 为条目在运行实例内的序号，从 1 开始。
    async fn produce_item(
        &self,
        queue: &Queue,
        run: &Run,
        templates: &[TaskRunTemplate],
        seq: i64,
        payload: Value,
    ) -> QueuerResult<()> {
        if templates.is_empty() {
            self.runs.increment_total(run.id, 1).await?;
            counter!("queuer_items_produced_total", "queue" => queue.name.clone()).increment(1);

            let stream = queue.stream();
            let message = StreamMessage::payload(queue.id, run.id, payload);
            if let Err(e) = self.transport.push(&stream, &message).await {
                warn!("写入 {} 失败，条目记为失败: {}", stream, e);
                let entry = format!("unsent-{seq}");
                if let Err(e) = self.runs.record_outcome(run.id, &entry, false).await {
                    error!("运行实例 {} 记录失败结果出错: {}", run.id, e);
                }
            }
            return Ok(());
        }

        let item = self.task_runs.create_item(run.id, &payload, templates).await?;
        let first = item.first_task_run().cloned().ok_or_else(|| {
            QueuerError::Internal(format!("条目 {} 没有任务运行实例", item.id))
        })?;
        self.runs.increment_total(run.id, 1).await?;
        counter!("queuer_items_produced_total", "queue" => queue.name.clone()).increment(1);

        let stream = queue.task_stream(&first.name);
        if let Err(e) = self
            .transport
            .push(&stream, &StreamMessage::task_run(first.id))
            .await
        {
            warn!("写入 {} 失败，任务运行实例 {} 记为失败: {}", stream, first.id, e);
            let outcome = TaskOutcome::err(format!("写入传输层失败: {e}"));
            match self.task_runs.settle(first.id, &outcome).await {
                Ok(Some(run)) => {
                    if let Err(e) = self.notifier.notify(&run, Some(first.task_id)).await {
                        error!("运行实例 {} 完成通知失败: {}", run.id, e);
                    }
                }
                Ok(None) => {}
                Err(e) => error!("结算任务运行实例 {} 失败: {}", first.id, e),
            }
        }
        Ok(())
    }
}
