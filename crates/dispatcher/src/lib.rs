//! 调度与生产
//!
//! - `Queuer` 按 cron 扫描到期的定时队列，监听触发通道，管理 Worker 生命周期
//! - `QueueRunner` 创建运行实例，逐条生成条目并写入传输层
//! - `cron_utils` 负责 cron 表达式的解析与下一次触发时间计算

pub mod cron_utils;
pub mod queue_runner;
pub mod queuer;

pub use cron_utils::CronScheduler;
pub use queue_runner::QueueRunner;
pub use queuer::Queuer;
