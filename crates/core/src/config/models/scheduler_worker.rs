use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::task_stream_name;

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 扫描到期队列的 cron 表达式（标准 5 字段）
    pub cron: String,
    /// 只处理名称匹配该 LIKE 模式的队列
    pub name_filter: Option<String>,
    /// Pub/Sub 触发通道名称
    pub trigger_channel: String,
    /// 停止时等待生产者排空的轮询间隔
    pub drain_poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "* * * * *".to_string(),
            name_filter: None,
            trigger_channel: "queuer".to_string(),
            drain_poll_interval_ms: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cron.trim().is_empty() {
            return Err(anyhow::anyhow!("调度cron表达式不能为空"));
        }

        if self.trigger_channel.is_empty() {
            return Err(anyhow::anyhow!("触发通道名称不能为空"));
        }

        if self.drain_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("排空轮询间隔必须大于0"));
        }

        Ok(())
    }
}

/// 任务的 JSON Schema 校验配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskSchemas {
    pub options: Option<Value>,
    pub payload: Option<Value>,
}

/// 单个任务 Worker 的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTaskConfig {
    /// 任务名称，同时作为消费者组名称
    pub name: String,
    /// 所属队列；为空时表示无任务链的队列，Stream 即为 `name`
    #[serde(default)]
    pub queue: Option<String>,
    /// 处理器名称
    pub handler: String,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub schemas: TaskSchemas,
}

impl WorkerTaskConfig {
    pub fn stream(&self) -> String {
        match &self.queue {
            Some(queue) => task_stream_name(queue, &self.name),
            None => self.name.clone(),
        }
    }

    pub fn group(&self) -> &str {
        &self.name
    }
}

/// Worker配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 记录在 TaskRun 上的主机标识
    pub host: String,
    /// 默认并发数
    pub concurrency: usize,
    /// 阻塞读取超时
    pub block_timeout_ms: u64,
    /// 每次读取的条目数，默认等于并发数
    pub read_count: Option<usize>,
    /// 认领空闲条目的阈值，0 表示禁用
    pub reclaim_idle_ms: u64,
    pub tasks: Vec<WorkerTaskConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            concurrency: 1,
            block_timeout_ms: 5000,
            read_count: None,
            reclaim_idle_ms: 60000,
            tasks: Vec::new(),
        }
    }
}

fn default_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("主机标识不能为空"));
        }

        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("并发数必须大于0"));
        }

        if self.block_timeout_ms == 0 {
            return Err(anyhow::anyhow!("阻塞读取超时必须大于0"));
        }

        if self.read_count == Some(0) {
            return Err(anyhow::anyhow!("每次读取条目数必须大于0"));
        }

        let mut streams = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(anyhow::anyhow!("任务名称不能为空"));
            }
            if task.handler.is_empty() {
                return Err(anyhow::anyhow!("任务 {} 未指定处理器", task.name));
            }
            if task.concurrency == Some(0) {
                return Err(anyhow::anyhow!("任务 {} 的并发数必须大于0", task.name));
            }
            if !streams.insert(task.stream()) {
                return Err(anyhow::anyhow!("重复的任务Stream: {}", task.stream()));
            }
        }

        Ok(())
    }

    /// 任务的有效并发数
    pub fn concurrency_for(&self, task: &WorkerTaskConfig) -> usize {
        task.concurrency.unwrap_or(self.concurrency)
    }
}
