use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Code, TaskRun};

/// 条目：带任务链的运行实例中的一个输入数据单元
///
/// `code` 反映条目的最终结果：最后一个任务成功为 `ok`，任一任务失败为 `err`。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: i64,
    pub run_id: i64,
    pub payload: Value,
    pub code: Code,
    #[serde(default)]
    pub task_runs: Vec<TaskRun>,
}

impl Item {
    pub fn first_task_run(&self) -> Option<&TaskRun> {
        self.task_runs.iter().min_by_key(|tr| tr.order)
    }
}
