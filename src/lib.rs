//! 队列编排系统
//!
//! 进程组装与优雅关闭；调度器、生产者与 Worker 分别位于各自的 crate 中。

pub mod app;
pub mod shutdown;

pub use app::{build_task_runners, AppMode, Application};
pub use shutdown::ShutdownManager;
