use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use queuer_core::{
    config::SchedulerConfig,
    models::{Queue, TriggerMessage, TriggerTarget},
    traits::{QueueRepository, TaskWorker, TriggerChannel},
    QueuerResult,
};

use crate::cron_utils::CronScheduler;
use crate::queue_runner::QueueRunner;

/// 调度器
///
/// 持有已注册的任务 Worker，按 cron 扫描到期队列，监听触发通道，
/// 并管理整体的启动与停止。
pub struct Queuer {
    inner: Arc<QueuerInner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

struct QueuerInner {
    config: SchedulerConfig,
    cron: CronScheduler,
    queues: Arc<dyn QueueRepository>,
    trigger: Arc<dyn TriggerChannel>,
    runner: Arc<QueueRunner>,
    workers: RwLock<Vec<Arc<dyn TaskWorker>>>,
    in_flight: AtomicUsize,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// 进行中生产任务的计数守卫
struct InFlightGuard(Arc<QueuerInner>);

impl InFlightGuard {
    fn new(inner: Arc<QueuerInner>) -> Self {
        let count = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("queuer_runs_producing").set(count as f64);
        Self(inner)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let count = self.0.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!("queuer_runs_producing").set(count as f64);
    }
}

impl Queuer {
    /// 创建调度器，调度 cron 表达式无效时返回配置错误
    pub fn new(
        config: SchedulerConfig,
        queues: Arc<dyn QueueRepository>,
        trigger: Arc<dyn TriggerChannel>,
        runner: Arc<QueueRunner>,
    ) -> QueuerResult<Self> {
        let cron = CronScheduler::new(&config.cron)?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(QueuerInner {
                config,
                cron,
                queues,
                trigger,
                runner,
                workers: RwLock::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                shutdown_tx,
            }),
            loops: Mutex::new(Vec::new()),
        })
    }

    /// 注册任务 Worker，同名 Worker 只注册一次
    ///
    /// 调度器已启动时立即启动新注册的 Worker。
    pub async fn register(&self, worker: Arc<dyn TaskWorker>) -> QueuerResult<bool> {
        {
            let mut workers = self.inner.workers.write().await;
            if workers.iter().any(|w| w.name() == worker.name()) {
                debug!("Worker {} 已注册，忽略", worker.name());
                return Ok(false);
            }
            workers.push(worker.clone());
        }
        info!("注册 Worker: {}", worker.name());

        if self.is_running() {
            worker.start().await?;
        }
        Ok(true)
    }

    pub async fn worker_names(&self) -> Vec<String> {
        self.inner
            .workers
            .read()
            .await
            .iter()
            .map(|w| w.name().to_string())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// 正在生产中的运行实例数
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// 启动 Worker、cron 扫描循环和触发通道订阅
    pub async fn start(&self) -> QueuerResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("调度器已在运行");
            return Ok(());
        }
        self.inner.shutdown_tx.send_replace(false);

        for worker in self.inner.workers.read().await.iter() {
            worker.start().await?;
        }

        if !self.inner.config.enabled {
            info!("调度已禁用，仅运行 Worker");
            return Ok(());
        }

        let receiver = self.inner.trigger.subscribe().await?;
        let mut loops = self.loops.lock().await;
        loops.push(tokio::spawn(Self::cron_loop(self.inner.clone())));
        loops.push(tokio::spawn(Self::trigger_loop(self.inner.clone(), receiver)));

        info!(
            "调度器已启动，cron: {}，名称过滤: {:?}",
            self.inner.cron.expression(),
            self.inner.config.name_filter
        );
        Ok(())
    }

    /// 停止调度器
    ///
    /// 取消订阅、停止所有 Worker，并等待进行中的生产任务结束。
    pub async fn stop(&self) -> QueuerResult<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在停止调度器");

        self.inner.shutdown_tx.send_replace(true);
        if self.inner.config.enabled {
            if let Err(e) = self.inner.trigger.unsubscribe().await {
                warn!("取消订阅触发通道失败: {}", e);
            }
        }
        for handle in self.loops.lock().await.drain(..) {
            if let Err(e) = handle.await {
                warn!("调度循环异常退出: {}", e);
            }
        }

        let workers: Vec<_> = self.inner.workers.read().await.clone();
        for worker in workers {
            if let Err(e) = worker.stop().await {
                error!("停止 Worker {} 失败: {}", worker.name(), e);
            }
        }

        self.drain().await;
        info!("调度器已停止");
        Ok(())
    }

    /// 等待所有进行中的生产任务结束
    pub async fn drain(&self) {
        let interval = Duration::from_millis(self.inner.config.drain_poll_interval_ms);
        loop {
            let count = self.in_flight();
            if count == 0 {
                return;
            }
            debug!("等待 {} 个生产任务结束", count);
            sleep(interval).await;
        }
    }

    /// 扫描并派发到期的定时队列，返回派发的队列数
    pub async fn scan(&self, now: DateTime<Utc>) -> QueuerResult<usize> {
        Self::scan_due(&self.inner, now).await
    }

    /// 处理一条触发消息，返回派发的队列数
    pub async fn handle_trigger(&self, message: &TriggerMessage) -> QueuerResult<usize> {
        Self::resolve_trigger(&self.inner, message).await
    }

    /// 直接派发一个队列
    pub fn dispatch(&self, queue: Queue, payload: Value) -> JoinHandle<()> {
        Self::spawn_run(&self.inner, queue, payload)
    }

    async fn cron_loop(inner: Arc<QueuerInner>) {
        let mut shutdown = inner.shutdown_tx.subscribe();
        loop {
            let now = Utc::now();
            let Some(next) = inner.cron.next_execution_time(now) else {
                warn!("调度表达式 {} 没有后续触发时间，停止扫描", inner.cron.expression());
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => {
                    debug!("cron 扫描循环收到停止信号");
                    return;
                }
            }

            if let Err(e) = Self::scan_due(&inner, Utc::now()).await {
                error!("扫描到期队列失败: {}", e);
            }
        }
    }

    async fn trigger_loop(
        inner: Arc<QueuerInner>,
        mut receiver: tokio::sync::mpsc::Receiver<TriggerMessage>,
    ) {
        let mut shutdown = inner.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                message = receiver.recv() => {
                    let Some(message) = message else {
                        debug!("触发通道已关闭");
                        return;
                    };
                    if let Err(e) = Self::resolve_trigger(&inner, &message).await {
                        error!("处理触发消息失败: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    debug!("触发监听循环收到停止信号");
                    return;
                }
            }
        }
    }

    #[instrument(skip(inner))]
    async fn scan_due(inner: &Arc<QueuerInner>, now: DateTime<Utc>) -> QueuerResult<usize> {
        let due = inner
            .queues
            .get_due_scheduled(now, inner.config.name_filter.as_deref())
            .await?;
        debug!("扫描到 {} 个到期队列", due.len());

        let mut dispatched = 0;
        for queue in due {
            let Some(schedule) = queue.schedule.clone() else {
                continue;
            };
            let next = match CronScheduler::new(&schedule.cron)
                .map(|cron| cron.next_execution_time(now))
            {
                Ok(Some(next)) => next,
                Ok(None) => {
                    warn!("队列 {} 的调度表达式没有后续触发时间", queue.name);
                    continue;
                }
                Err(e) => {
                    error!("队列 {} 的调度表达式无效: {}", queue.name, e);
                    continue;
                }
            };

            // 先推进下一次触发时间再派发，推进失败说明已被其他实例处理
            match inner
                .queues
                .advance_schedule(queue.id, schedule.next, next)
                .await
            {
                Ok(true) => {
                    debug!("队列 {} 下次触发时间: {}", queue.name, next);
                    Self::spawn_run(inner, queue, Value::Null);
                    dispatched += 1;
                }
                Ok(false) => debug!("队列 {} 已被其他调度实例处理", queue.name),
                Err(e) => error!("推进队列 {} 的调度时间失败: {}", queue.name, e),
            }
        }

        counter!("queuer_scheduled_dispatch_total").increment(dispatched as u64);
        Ok(dispatched)
    }

    async fn resolve_trigger(
        inner: &Arc<QueuerInner>,
        message: &TriggerMessage,
    ) -> QueuerResult<usize> {
        let Some(target) = message.target() else {
            debug!("忽略无目标的触发消息: {:?}", message);
            return Ok(0);
        };

        let queues = match &target {
            TriggerTarget::Id(id) => inner.queues.get_by_id(*id).await?.into_iter().collect(),
            TriggerTarget::Name(name) => inner.queues.get_by_name(name).await?,
        };
        if queues.is_empty() {
            warn!("触发目标不存在: {:?}", target);
            return Ok(0);
        }

        let payload = message.run_payload();
        let mut dispatched = 0;
        for queue in queues {
            if !queue.matches_filter(inner.config.name_filter.as_deref()) {
                debug!("队列 {} 不匹配名称过滤，忽略", queue.name);
                continue;
            }
            info!("收到触发请求，派发队列 {} ({})", queue.id, queue.name);
            Self::spawn_run(inner, queue, payload.clone());
            dispatched += 1;
        }
        counter!("queuer_triggered_dispatch_total").increment(dispatched as u64);
        Ok(dispatched)
    }

    fn spawn_run(inner: &Arc<QueuerInner>, queue: Queue, payload: Value) -> JoinHandle<()> {
        let guard = InFlightGuard::new(inner.clone());
        let runner = inner.runner.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = runner.run(&queue, payload).await {
                error!("队列 {} 运行失败: {}", queue.name, e);
                counter!("queuer_run_failures_total").increment(1);
            }
        })
    }
}
