//! 任务 Worker
//!
//! `TaskRunner` 通过消费者组消费一个任务 Stream，在有界工作池中执行处理器，
//! 持久化结果后确认条目，并推进任务链或触发下游队列。

pub mod components;
pub mod handlers;
pub mod service;

pub use components::{EntryProcessor, SchemaValidator};
pub use handlers::{HandlerRegistry, HttpHandler, LogHandler};
pub use service::{TaskRunner, TaskRunnerBuilder};
