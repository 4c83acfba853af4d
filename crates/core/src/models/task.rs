use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务运行选项，名称到值的映射
///
/// 创建 TaskRun 时由 Task 的选项复制而来，随后与该 TaskRun 一起持久化，
/// 不再受 Task 定义后续修改的影响。
pub type TaskRunOptions = BTreeMap<String, Value>;

/// 任务定义
///
/// 队列处理链中的一个步骤。
///
/// # 字段说明
///
/// - `id`: 任务的唯一标识符
/// - `queue_id`: 所属队列
/// - `name`: 任务名称，决定 Stream 名称和消费者组
/// - `order`: 在任务链中的位置，从 1 开始，严格递增
/// - `options`: 传递给 Worker 的选项
///
/// # 使用示例
///
/// ```rust
/// use queuer_core::models::Task;
/// use serde_json::json;
///
/// let task = Task::new(1, 7, "send_mail", 1).with_option("template", json!("welcome"));
/// assert_eq!(task.options["template"], json!("welcome"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub queue_id: i64,
    pub name: String,
    pub order: i32,
    #[serde(default)]
    pub options: TaskRunOptions,
}

impl Task {
    pub fn new(id: i64, queue_id: i64, name: impl Into<String>, order: i32) -> Self {
        Self {
            id,
            queue_id,
            name: name.into(),
            order,
            options: TaskRunOptions::new(),
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, value: Value) -> Self {
        self.options.insert(name.into(), value);
        self
    }
}
