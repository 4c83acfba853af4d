//! 数据仓储层接口定义
//!
//! 关系存储是运行实例与任务运行实例状态的唯一事实来源：
//! - `QueueRepository` - 队列定义读取与调度时间推进
//! - `RunRepository` - 运行实例的创建与聚合计数
//! - `TaskRunRepository` - 条目与任务运行实例的生命周期
//!
//! ## 并发约定
//!
//! 所有影响完成检测的修改都必须是单条原子条件更新（或单个事务），
//! 不使用应用层锁：
//! - 聚合计数的自增与 `status` 的重新推导在同一语句中完成
//! - 任务运行实例的结算以 `code = 'pending'` 为条件，重投递不会重复计数
//! - `claim_completion` 以 `completion_claimed` 标记保证下游只触发一次
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! async fn settle(repo: &dyn TaskRunRepository, id: i64) -> QueuerResult<()> {
//!     if let Some(run) = repo.settle(id, &TaskOutcome::ok(json!({}))).await? {
//!         println!("运行实例 {} 状态: {}", run.id, run.status);
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    models::{Item, Queue, Run, SourceConnection, TaskOutcome, TaskRun, TaskRunTemplate, TaskRunUnit},
    QueuerResult,
};

/// 队列仓储接口
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// 根据ID获取队列（含按顺序排列的任务）
    async fn get_by_id(&self, id: i64) -> QueuerResult<Option<Queue>>;

    /// 根据名称获取队列，名称不保证唯一
    async fn get_by_name(&self, name: &str) -> QueuerResult<Vec<Queue>>;

    /// 获取到期的定时队列
    ///
    /// 条件：`begin <= now <= end`、`next <= now`（或尚未计算），
    /// 且名称匹配 `name_filter`（SQL LIKE 模式）。
    async fn get_due_scheduled(
        &self,
        now: DateTime<Utc>,
        name_filter: Option<&str>,
    ) -> QueuerResult<Vec<Queue>>;

    /// 推进下一次触发时间
    ///
    /// 仅当当前值仍等于 `expected` 时更新，返回是否更新成功。
    async fn advance_schedule(
        &self,
        queue_id: i64,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> QueuerResult<bool>;

    /// 获取以指定队列为前置队列的下游队列
    async fn get_dependents(&self, queue_id: i64) -> QueuerResult<Vec<Queue>>;

    /// 获取数据源连接
    async fn get_connection(&self, id: i64) -> QueuerResult<Option<SourceConnection>>;
}

/// 运行实例仓储接口
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// 创建运行实例，状态为 pending，计数器为 0
    async fn create(&self, queue: &Queue, payload: &Value) -> QueuerResult<Run>;

    async fn get_by_id(&self, id: i64) -> QueuerResult<Option<Run>>;

    /// 生产过程中累加总数
    async fn increment_total(&self, run_id: i64, by: i64) -> QueuerResult<()>;

    /// 写入最终总数并封存，同一语句中重新推导状态
    async fn finalize_total(&self, run_id: i64, total: i64) -> QueuerResult<Run>;

    /// 原子地记录一个结果（无任务链的队列）
    ///
    /// `entry` 在运行实例内唯一标识条目（通常是 Stream 条目 id），
    /// 记账与登记在同一事务中完成。条目已登记或运行实例已结束时返回 `None`，
    /// 重投递的条目不会重复计数。
    async fn record_outcome(
        &self,
        run_id: i64,
        entry: &str,
        success: bool,
    ) -> QueuerResult<Option<Run>>;

    /// 条目是否已记账
    async fn entry_recorded(&self, run_id: i64, entry: &str) -> QueuerResult<bool>;

    /// 认领完成事件
    ///
    /// 仅当运行实例已结束、尚未被认领，且 `task_id` 为空或与运行实例上
    /// 记录的最近结算任务一致时成功。成功的调用方负责触发下游队列。
    async fn claim_completion(&self, run_id: i64, task_id: Option<i64>) -> QueuerResult<bool>;
}

/// 条目与任务运行实例仓储接口
#[async_trait]
pub trait TaskRunRepository: Send + Sync {
    /// 创建条目及其按模板复制的任务运行实例
    async fn create_item(
        &self,
        run_id: i64,
        payload: &Value,
        templates: &[TaskRunTemplate],
    ) -> QueuerResult<Item>;

    /// 加载任务运行实例及其条目、运行实例和相邻任务
    async fn get_unit(&self, task_run_id: i64) -> QueuerResult<Option<TaskRunUnit>>;

    /// 标记开始执行
    ///
    /// 仅当任务运行实例仍为 pending 且未被其他条目认领时成功，否则返回 `None`。
    async fn mark_started(
        &self,
        task_run_id: i64,
        xid: &str,
        host: &str,
    ) -> QueuerResult<Option<TaskRun>>;

    /// 结算任务运行实例
    ///
    /// 在一个事务中写入结果、更新条目，并在条目结束时（最后一个任务成功，
    /// 或任一任务失败）原子地更新运行实例计数。
    /// 任务运行实例已结算时返回 `None`，不会重复计数。
    async fn settle(&self, task_run_id: i64, outcome: &TaskOutcome) -> QueuerResult<Option<Run>>;
}
