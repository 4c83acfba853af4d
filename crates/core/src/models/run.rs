use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Code;

/// 运行实例
///
/// 队列的一次执行。计数器满足 `aggr_ok + aggr_err <= aggr_total`。
///
/// 生产者在条目流结束后设置 `sealed`，此后 `aggr_total` 不再变化；
/// 只有已封存且 `aggr_ok + aggr_err == aggr_total` 时 `status` 才离开 `pending`。
/// `completion_claimed` 保证下游触发只发生一次。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: i64,
    pub queue_id: i64,
    pub name: String,
    pub aggr_total: i64,
    pub aggr_ok: i64,
    pub aggr_err: i64,
    pub status: Code,
    /// 最近一次结算的任务 id
    pub task_id: Option<i64>,
    pub sealed: bool,
    pub completion_claimed: bool,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn settled(&self) -> i64 {
        self.aggr_ok + self.aggr_err
    }

    /// 按当前计数推导状态
    pub fn derive_status(&self) -> Code {
        if self.sealed && self.settled() == self.aggr_total {
            Code::from_success(self.aggr_err == 0)
        } else {
            Code::Pending
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_settled()
    }
}
