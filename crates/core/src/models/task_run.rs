use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Code, Run, Task, TaskRunOptions};

/// 任务运行实例模板
///
/// 运行实例创建时由队列的任务列表生成，创建条目时复制到每个条目的 TaskRun 上。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRunTemplate {
    pub task_id: i64,
    pub name: String,
    pub order: i32,
    pub options: TaskRunOptions,
}

impl From<&Task> for TaskRunTemplate {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            order: task.order,
            options: task.options.clone(),
        }
    }
}

/// 任务运行实例
///
/// 每个 (条目, 任务) 对应一条记录，只会被修改两次：
/// 出队时写入 `started`/`xid`/`host`，完成时写入 `code`/`reason`/`result`。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRun {
    pub id: i64,
    pub item_id: i64,
    pub run_id: i64,
    pub task_id: i64,
    pub name: String,
    pub order: i32,
    pub code: Code,
    pub started: Option<DateTime<Utc>>,
    pub xid: Option<String>,
    pub reason: Option<String>,
    pub result: Option<Value>,
    pub options: TaskRunOptions,
    pub host: Option<String>,
}

impl TaskRun {
    /// 是否可以由指定的传输条目开始执行
    ///
    /// 未结算，且未被认领或由同一条目认领（重投递）。
    pub fn can_start(&self, xid: &str) -> bool {
        self.code.is_pending() && self.xid.as_deref().map_or(true, |claimed| claimed == xid)
    }
}

/// 任务执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub code: Code,
    pub reason: Option<String>,
    pub result: Option<Value>,
}

impl TaskOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            code: Code::Ok,
            reason: None,
            result: Some(result),
        }
    }

    pub fn err(reason: impl Into<String>) -> Self {
        Self {
            code: Code::Err,
            reason: Some(reason.into()),
            result: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

/// Worker 处理一个 TaskRun 所需的完整上下文
#[derive(Debug, Clone)]
pub struct TaskRunUnit {
    pub task_run: TaskRun,
    pub run: Run,
    pub payload: Value,
    /// 链中前一个任务的结果
    pub previous_result: Option<Value>,
    /// 链中下一个任务运行实例
    pub next: Option<TaskRun>,
}

/// 交给任务处理器的工作单元
///
/// 链式队列中由 TaskRun 解析而来；无任务链的队列直接由原始负载构造，
/// 此时 `item_id`/`task_run_id` 为空。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkUnit {
    pub run_id: i64,
    pub queue_id: i64,
    pub queue_name: String,
    pub item_id: Option<i64>,
    pub task_run_id: Option<i64>,
    pub task_name: String,
    pub options: TaskRunOptions,
    pub payload: Value,
    pub previous_result: Option<Value>,
    pub host: String,
    pub xid: String,
}

impl WorkUnit {
    pub fn from_task_run(unit: &TaskRunUnit, host: &str, xid: &str) -> Self {
        Self {
            run_id: unit.run.id,
            queue_id: unit.run.queue_id,
            queue_name: unit.run.name.clone(),
            item_id: Some(unit.task_run.item_id),
            task_run_id: Some(unit.task_run.id),
            task_name: unit.task_run.name.clone(),
            options: unit.task_run.options.clone(),
            payload: unit.payload.clone(),
            previous_result: unit.previous_result.clone(),
            host: host.to_string(),
            xid: xid.to_string(),
        }
    }

    /// 选项的 JSON 形式，用于校验
    pub fn options_value(&self) -> Value {
        Value::Object(self.options.clone().into_iter().collect())
    }
}
