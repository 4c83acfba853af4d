//! # 数据模型
//!
//! 定义队列编排系统的核心数据结构：队列、任务、运行实例、条目、任务运行实例，
//! 以及在 Stream 和触发通道上传输的消息。
//!
//! ## 核心模型
//!
//! ### Queue - 队列定义
//! 可调度、可触发的工作单元定义。可以带有 cron 计划、数据源查询，
//! 以及前置队列（前置队列的运行完成后触发本队列）。
//!
//! ### Task - 任务定义
//! 队列处理链中的一个步骤，按 `order` 排序，每个任务对应一个 Stream。
//!
//! ### Run - 运行实例
//! 队列的一次执行，带有聚合计数器 `aggr_total/aggr_ok/aggr_err`。
//!
//! ### Item / TaskRun - 条目与任务运行实例
//! 带任务链的队列中，每条输入数据对应一个 Item，Item 下每个 Task 对应一个 TaskRun。
//!
//! ## 状态机
//!
//! - TaskRun: `pending → started → {ok | err}`，终态不可变
//! - Run: `pending → {ok | err}`，由原子聚合更新保证只发生一次
//!
//! ## 使用示例
//!
//! ```rust
//! use queuer_core::models::{Queue, Task};
//! use serde_json::json;
//!
//! let mut queue = Queue::new(1, "orders");
//! queue.tasks.push(Task::new(10, 1, "enrich", 1).with_option("lang", json!("zh")));
//! queue.tasks.push(Task::new(11, 1, "notify", 2));
//!
//! assert!(queue.has_chain());
//! assert_eq!(queue.first_task().map(|t| t.name.as_str()), Some("enrich"));
//! ```

mod code;
mod item;
mod message;
mod queue;
mod run;
mod task;
mod task_run;

pub use code::Code;
pub use item::Item;
pub use message::{Delivery, StreamMessage, TriggerMessage, TriggerTarget, RUN_COMMAND};
pub use queue::{like_match, task_stream_name, Queue, QueueSchedule, SourceConnection};
pub use run::Run;
pub use task::{Task, TaskRunOptions};
pub use task_run::{TaskOutcome, TaskRun, TaskRunTemplate, TaskRunUnit, WorkUnit};
