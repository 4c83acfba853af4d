use std::sync::Arc;

use anyhow::{Context, Result};
use queuer_core::{
    config::{AppConfig, WorkerConfig},
    traits::{RunRepository, StreamTransport, TaskRunRepository, TriggerChannel},
    CompletionNotifier, QueuerResult,
};
use queuer_dispatcher::{QueueRunner, Queuer};
use queuer_infrastructure::{
    DatabaseManager, RedisConnectionManager, RedisStreamMetrics, RedisStreamTransport,
    RedisTriggerChannel,
};
use queuer_worker::{HandlerRegistry, TaskRunner, TaskRunnerBuilder};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 只运行调度器：cron 扫描与触发通道
    Scheduler,
    /// 只运行任务 Worker
    Worker,
    /// 调度器与 Worker 在同一进程中运行
    All,
}

impl AppMode {
    pub fn runs_scheduler(self) -> bool {
        matches!(self, AppMode::Scheduler | AppMode::All)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }
}

/// 主应用程序
///
/// 负责组装数据库、Redis 传输、触发通道、生产者与 Worker，
/// 并把它们交给调度器统一启动和停止。
pub struct Application {
    mode: AppMode,
    database: DatabaseManager,
    transport: Arc<dyn StreamTransport>,
    queuer: Queuer,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig, mode: AppMode, handlers: HandlerRegistry) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let database = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        if config.database.run_migrations {
            database.migrate().await.context("数据库迁移失败")?;
        }

        let redis_metrics = Arc::new(RedisStreamMetrics::default());
        let redis = Arc::new(
            RedisConnectionManager::connect(config.redis.clone(), redis_metrics.clone())
                .await
                .context("连接Redis失败")?,
        );
        let transport: Arc<dyn StreamTransport> =
            Arc::new(RedisStreamTransport::new(redis.clone(), redis_metrics));
        let trigger: Arc<dyn TriggerChannel> = Arc::new(RedisTriggerChannel::new(
            redis,
            config.scheduler.trigger_channel.clone(),
        ));

        let queues = database.queue_repository();
        let runs = database.run_repository();
        let task_runs = database.task_run_repository();
        let notifier = Arc::new(CompletionNotifier::new(
            queues.clone(),
            runs.clone(),
            trigger.clone(),
        ));
        let runner = Arc::new(QueueRunner::new(
            queues.clone(),
            runs.clone(),
            task_runs.clone(),
            transport.clone(),
            database.source_executor(&config.database),
            notifier.clone(),
        ));

        let mut scheduler = config.scheduler.clone();
        scheduler.enabled = scheduler.enabled && mode.runs_scheduler();
        let queuer = Queuer::new(scheduler, queues, trigger, runner)?;

        if mode.runs_workers() && config.worker.enabled {
            for worker in build_task_runners(
                &config.worker,
                &handlers,
                runs,
                task_runs,
                transport.clone(),
                notifier,
            )? {
                queuer.register(Arc::new(worker)).await?;
            }
        }

        Ok(Self {
            mode,
            database,
            transport,
            queuer,
        })
    }

    pub fn queuer(&self) -> &Queuer {
        &self.queuer
    }

    /// 运行应用程序，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.transport
            .health_check()
            .await
            .context("Redis健康检查失败")?;
        self.database
            .health_check()
            .await
            .context("数据库健康检查失败")?;

        self.queuer.start().await?;
        info!(
            "应用程序已启动，模式: {:?}，Worker: {:?}",
            self.mode,
            self.queuer.worker_names().await
        );

        let _ = shutdown_rx.recv().await;
        info!("应用程序收到关闭信号");

        if let Err(e) = self.queuer.stop().await {
            warn!("停止调度器时发生错误: {}", e);
        }
        self.database.close().await;
        info!("应用程序已停止");
        Ok(())
    }
}

/// 按配置为每个任务构建 Worker
///
/// 配置中引用了未注册的处理器时返回配置错误。
pub fn build_task_runners(
    config: &WorkerConfig,
    handlers: &HandlerRegistry,
    runs: Arc<dyn RunRepository>,
    task_runs: Arc<dyn TaskRunRepository>,
    transport: Arc<dyn StreamTransport>,
    notifier: Arc<CompletionNotifier>,
) -> QueuerResult<Vec<TaskRunner>> {
    config
        .tasks
        .iter()
        .map(|task| {
            TaskRunnerBuilder::from_config(config, task)
                .handler(handlers.get(&task.handler)?)
                .runs(runs.clone())
                .task_runs(task_runs.clone())
                .transport(transport.clone())
                .notifier(notifier.clone())
                .build()
        })
        .collect()
}
