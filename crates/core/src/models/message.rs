use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 下游触发消息中的命令
pub const RUN_COMMAND: &str = "run";

/// Stream 条目内容
///
/// 链式队列的条目只携带 TaskRun 引用，无任务链的队列携带原始负载。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    TaskRun {
        task_run_id: i64,
    },
    Payload {
        queue_id: i64,
        run_id: i64,
        payload: Value,
    },
}

impl StreamMessage {
    pub fn task_run(task_run_id: i64) -> Self {
        StreamMessage::TaskRun { task_run_id }
    }

    pub fn payload(queue_id: i64, run_id: i64, payload: Value) -> Self {
        StreamMessage::Payload {
            queue_id,
            run_id,
            payload,
        }
    }
}

/// 从 Stream 读取到的一次投递
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// 传输层条目 id，确认时使用
    pub xid: String,
    pub stream: String,
    pub message: StreamMessage,
}

/// 触发消息的目标队列
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerTarget {
    Id(i64),
    Name(String),
}

/// 触发通道上的消息
///
/// 临时运行请求为 `{id|name, payload?}`，
/// 运行完成后的下游触发为 `{queue_id, run_id, command: "run"}`。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TriggerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl TriggerMessage {
    pub fn by_id(id: i64, payload: Option<Value>) -> Self {
        Self {
            id: Some(id),
            payload,
            ..Default::default()
        }
    }

    pub fn by_name(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            name: Some(name.into()),
            payload,
            ..Default::default()
        }
    }

    /// 前置队列运行完成后触发下游队列
    pub fn downstream(queue_id: i64, run_id: i64) -> Self {
        Self {
            queue_id: Some(queue_id),
            run_id: Some(run_id),
            command: Some(RUN_COMMAND.to_string()),
            ..Default::default()
        }
    }

    /// 解析目标队列，`queue_id` 优先于 `id`，其次为 `name`
    pub fn target(&self) -> Option<TriggerTarget> {
        if let Some(command) = &self.command {
            if command != RUN_COMMAND {
                return None;
            }
        }
        self.queue_id
            .or(self.id)
            .map(TriggerTarget::Id)
            .or_else(|| self.name.clone().map(TriggerTarget::Name))
    }

    /// 传给运行实例的负载
    ///
    /// 显式负载优先；下游触发时为前置运行实例的 id。
    pub fn run_payload(&self) -> Value {
        match (&self.payload, self.run_id) {
            (Some(payload), _) => payload.clone(),
            (None, Some(run_id)) => Value::from(run_id),
            (None, None) => Value::Null,
        }
    }
}
