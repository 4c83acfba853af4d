use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use queuer_core::{
    config::{TaskSchemas, WorkerConfig, WorkerTaskConfig},
    models::Delivery,
    traits::{ReadRequest, RunRepository, StreamTransport, TaskHandler, TaskRunRepository, TaskWorker},
    CompletionNotifier, QueuerError, QueuerResult,
};

use crate::components::{EntryProcessor, SchemaValidator};

/// 读取失败（非连接断开）后的重试间隔
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// 任务 Worker 构建器
pub struct TaskRunnerBuilder {
    name: Option<String>,
    stream: Option<String>,
    group: Option<String>,
    consumer: Option<String>,
    host: Option<String>,
    concurrency: usize,
    block_timeout: Duration,
    read_count: Option<usize>,
    reclaim_idle: Option<Duration>,
    drain_poll_interval: Duration,
    schemas: TaskSchemas,
    handler: Option<Arc<dyn TaskHandler>>,
    runs: Option<Arc<dyn RunRepository>>,
    task_runs: Option<Arc<dyn TaskRunRepository>>,
    transport: Option<Arc<dyn StreamTransport>>,
    notifier: Option<Arc<CompletionNotifier>>,
}

impl Default for TaskRunnerBuilder {
    fn default() -> Self {
        Self {
            name: None,
            stream: None,
            group: None,
            consumer: None,
            host: None,
            concurrency: 1,
            block_timeout: Duration::from_millis(5000),
            read_count: None,
            reclaim_idle: Some(Duration::from_millis(60000)),
            drain_poll_interval: Duration::from_millis(100),
            schemas: TaskSchemas::default(),
            handler: None,
            runs: None,
            task_runs: None,
            transport: None,
            notifier: None,
        }
    }
}

impl TaskRunnerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// 按 Worker 配置和任务配置初始化
    pub fn from_config(worker: &WorkerConfig, task: &WorkerTaskConfig) -> Self {
        let reclaim_idle =
            (worker.reclaim_idle_ms > 0).then(|| Duration::from_millis(worker.reclaim_idle_ms));
        Self {
            name: Some(task.name.clone()),
            stream: Some(task.stream()),
            group: Some(task.group().to_string()),
            host: Some(worker.host.clone()),
            concurrency: worker.concurrency_for(task),
            block_timeout: Duration::from_millis(worker.block_timeout_ms),
            read_count: worker.read_count,
            reclaim_idle,
            schemas: task.schemas.clone(),
            ..Self::default()
        }
    }

    /// Stream 名称，默认等于任务名称
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// 消费者组名称，默认等于任务名称
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// 消费者名称，默认等于主机标识
    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    pub fn read_count(mut self, read_count: usize) -> Self {
        self.read_count = Some(read_count);
        self
    }

    /// 认领其他消费者空闲条目的阈值，`None` 表示禁用
    pub fn reclaim_idle(mut self, reclaim_idle: Option<Duration>) -> Self {
        self.reclaim_idle = reclaim_idle;
        self
    }

    pub fn drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    pub fn schemas(mut self, schemas: TaskSchemas) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn runs(mut self, runs: Arc<dyn RunRepository>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn task_runs(mut self, task_runs: Arc<dyn TaskRunRepository>) -> Self {
        self.task_runs = Some(task_runs);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn StreamTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn notifier(mut self, notifier: Arc<CompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// 构建 Worker，缺少必需项或 Schema 无效时返回配置错误
    pub fn build(self) -> QueuerResult<TaskRunner> {
        fn required<T>(value: Option<T>, what: &str) -> QueuerResult<T> {
            value.ok_or_else(|| QueuerError::configuration(format!("任务Worker缺少{what}")))
        }

        let name = required(self.name.filter(|n| !n.is_empty()), "任务名称")?;
        if self.concurrency == 0 {
            return Err(QueuerError::configuration(format!(
                "任务 {name} 的并发数必须大于0"
            )));
        }
        if self.block_timeout.is_zero() {
            return Err(QueuerError::configuration("阻塞读取超时必须大于0"));
        }
        let host = required(self.host, "主机标识")?;
        let validator = SchemaValidator::compile(&self.schemas)?;

        let processor = EntryProcessor {
            task_name: name.clone(),
            group: self.group.clone().unwrap_or_else(|| name.clone()),
            host: host.clone(),
            runs: required(self.runs, "运行实例仓储")?,
            task_runs: required(self.task_runs, "任务运行实例仓储")?,
            transport: required(self.transport, "传输层")?,
            notifier: required(self.notifier, "完成通知器")?,
            handler: required(self.handler, "任务处理器")?,
            validator,
        };

        let (shutdown_tx, _) = watch::channel(false);
        Ok(TaskRunner {
            inner: Arc::new(RunnerInner {
                stream: self.stream.unwrap_or_else(|| name.clone()),
                group: processor.group.clone(),
                consumer: self.consumer.unwrap_or(host),
                concurrency: self.concurrency,
                block_timeout: self.block_timeout,
                read_count: self.read_count.unwrap_or(self.concurrency).max(1),
                reclaim_idle: self.reclaim_idle,
                drain_poll_interval: self.drain_poll_interval,
                name,
                processor,
                pool: Arc::new(Semaphore::new(self.concurrency)),
                in_flight: AtomicUsize::new(0),
                processing: Mutex::new(HashSet::new()),
                running: AtomicBool::new(false),
                shutdown_tx,
            }),
            read_loop: tokio::sync::Mutex::new(None),
        })
    }
}

struct RunnerInner {
    name: String,
    stream: String,
    group: String,
    consumer: String,
    concurrency: usize,
    block_timeout: Duration,
    read_count: usize,
    reclaim_idle: Option<Duration>,
    drain_poll_interval: Duration,
    processor: EntryProcessor,
    pool: Arc<Semaphore>,
    in_flight: AtomicUsize,
    /// 正在处理的条目 id，认领时跳过
    processing: Mutex<HashSet<String>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// 任务 Worker
///
/// 通过消费者组消费一个任务 Stream：读取循环同一时刻只有一个阻塞读取，
/// 读到的条目交给大小为 `concurrency` 的工作池执行，读取循环随即重新读取，
/// 工作池满时读取循环等待空位。
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
    read_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn builder(name: impl Into<String>) -> TaskRunnerBuilder {
        TaskRunnerBuilder::new(name)
    }

    pub fn stream(&self) -> &str {
        &self.inner.stream
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// 等待工作池中的任务全部结束
    pub async fn drain(&self) {
        loop {
            let count = self.in_flight();
            if count == 0 {
                return;
            }
            debug!("Worker {} 等待 {} 个任务结束", self.inner.name, count);
            sleep(self.inner.drain_poll_interval).await;
        }
    }
}

impl RunnerInner {
    fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn read_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        // 先处理本消费者已投递未确认的条目
        let mut read_pending = true;
        let mut pending_seen: HashSet<String> = HashSet::new();
        let mut last_reclaim = Instant::now();

        while !self.is_stopping() {
            if let Some(min_idle) = self.reclaim_idle {
                if last_reclaim.elapsed() >= min_idle {
                    last_reclaim = Instant::now();
                    self.reclaim(min_idle).await;
                }
            }

            let request = ReadRequest {
                stream: self.stream.clone(),
                group: self.group.clone(),
                consumer: self.consumer.clone(),
                count: self.read_count,
                block: self.block_timeout,
                pending: read_pending,
            };

            match self.processor.transport.read_group(&request).await {
                Ok(deliveries) if read_pending => {
                    // 处理失败的条目仍在待确认列表中，本轮只处理一次，之后交给认领
                    let fresh: Vec<_> = deliveries
                        .into_iter()
                        .filter(|d| pending_seen.insert(d.xid.clone()))
                        .collect();
                    if fresh.is_empty() {
                        debug!("Worker {} 的待确认条目已处理完毕", self.name);
                        read_pending = false;
                        pending_seen.clear();
                        continue;
                    }
                    for delivery in fresh {
                        self.clone().dispatch(delivery).await;
                    }
                    self.wait_idle().await;
                }
                Ok(deliveries) => {
                    for delivery in deliveries {
                        self.clone().dispatch(delivery).await;
                    }
                }
                Err(e) if e.is_connection_closed() => {
                    warn!("Worker {} 传输连接断开，等待恢复: {}", self.name, e);
                    counter!("queuer_transport_disconnects_total", "task" => self.name.clone())
                        .increment(1);
                    tokio::select! {
                        result = self.processor.transport.wait_until_connected() => {
                            if let Err(e) = result {
                                error!("等待连接恢复失败: {}", e);
                                sleep(READ_ERROR_BACKOFF).await;
                            } else {
                                info!("Worker {} 传输连接已恢复", self.name);
                                if let Err(e) = self
                                    .processor
                                    .transport
                                    .ensure_group(&self.stream, &self.group)
                                    .await
                                {
                                    warn!("重新创建消费者组失败: {}", e);
                                }
                                read_pending = true;
                            }
                        }
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!("Worker {} 读取失败: {}", self.name, e);
                    tokio::select! {
                        _ = sleep(READ_ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        debug!("Worker {} 读取循环已退出", self.name);
    }

    async fn reclaim(self: &Arc<Self>, min_idle: Duration) {
        let reclaimed = match self
            .processor
            .transport
            .reclaim(&self.stream, &self.group, &self.consumer, min_idle, self.read_count)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(e) => {
                warn!("Worker {} 认领空闲条目失败: {}", self.name, e);
                return;
            }
        };
        if reclaimed.is_empty() {
            return;
        }
        info!("Worker {} 认领 {} 个空闲条目", self.name, reclaimed.len());
        counter!("queuer_entries_reclaimed_total", "task" => self.name.clone())
            .increment(reclaimed.len() as u64);
        for delivery in reclaimed {
            self.clone().dispatch(delivery).await;
        }
    }

    /// 把条目交给工作池，工作池满时等待
    async fn dispatch(self: Arc<Self>, delivery: Delivery) {
        {
            let mut processing = self.processing.lock().unwrap_or_else(|e| e.into_inner());
            if !processing.insert(delivery.xid.clone()) {
                debug!("条目 {} 正在处理中，跳过", delivery.xid);
                return;
            }
        }

        let permit = match self.pool.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.processing
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&delivery.xid);
                return;
            }
        };

        let count = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("queuer_worker_in_flight", "task" => self.name.clone()).set(count as f64);

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = self.processor.process(&delivery).await {
                error!(
                    "Worker {} 处理条目 {} 失败，等待重投递: {}",
                    self.name, delivery.xid, e
                );
                counter!("queuer_entry_failures_total", "task" => self.name.clone()).increment(1);
            }
            self.finish(&delivery.xid);
        });
    }

    fn finish(&self, xid: &str) {
        self.processing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(xid);
        let count = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("queuer_worker_in_flight", "task" => self.name.clone()).set(count as f64);
    }

    async fn wait_idle(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            sleep(self.drain_poll_interval).await;
        }
    }
}

#[async_trait]
impl TaskWorker for TaskRunner {
    fn name(&self) -> &str {
        &self.inner.stream
    }

    async fn start(&self) -> QueuerResult<()> {
        let mut read_loop = self.read_loop.lock().await;
        if read_loop.is_some() {
            return Ok(());
        }

        self.inner
            .processor
            .transport
            .ensure_group(&self.inner.stream, &self.inner.group)
            .await?;

        self.inner.shutdown_tx.send_replace(false);
        self.inner.running.store(true, Ordering::SeqCst);
        *read_loop = Some(tokio::spawn(self.inner.clone().read_loop()));
        info!(
            "Worker {} 已启动: stream={}, group={}, consumer={}, 并发数={}",
            self.inner.name,
            self.inner.stream,
            self.inner.group,
            self.inner.consumer,
            self.inner.concurrency
        );
        Ok(())
    }

    async fn stop(&self) -> QueuerResult<()> {
        let Some(handle) = self.read_loop.lock().await.take() else {
            return Ok(());
        };
        info!("正在停止 Worker {}", self.inner.name);
        self.inner.shutdown_tx.send_replace(true);
        if let Err(e) = handle.await {
            warn!("Worker {} 读取循环异常退出: {}", self.inner.name, e);
        }
        self.drain().await;
        self.inner.running.store(false, Ordering::SeqCst);
        info!("Worker {} 已停止", self.inner.name);
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}
