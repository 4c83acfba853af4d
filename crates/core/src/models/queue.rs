use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Task;

/// 队列的调度计划
///
/// `cron` 为标准 5 字段表达式（也接受带秒的 6/7 字段形式），
/// `begin`/`end` 限定活动窗口，`next` 为下一次触发时间。
/// 运行时只会修改 `next`。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSchedule {
    pub cron: String,
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub next: Option<DateTime<Utc>>,
}

impl QueueSchedule {
    pub fn new(cron: impl Into<String>) -> Self {
        Self {
            cron: cron.into(),
            begin: None,
            end: None,
            next: None,
        }
    }

    /// 当前时刻是否处于活动窗口内
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.begin.map_or(true, |begin| begin <= now) && self.end.map_or(true, |end| now <= end)
    }

    /// 是否到期：处于活动窗口内且下一次触发时间不晚于当前时刻
    ///
    /// 尚未计算过 `next` 的计划视为到期。
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active(now) && self.next.map_or(true, |next| next <= now)
    }
}

/// 数据源连接定义
///
/// 队列的 `query` 在该连接上执行，每一行结果成为一个条目。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConnection {
    pub id: i64,
    pub name: String,
    pub dsn: String,
}

/// 队列定义
///
/// 由运维人员配置，对运行时只读（`schedule.next` 除外）。
/// `tasks` 始终按 `order` 升序排列。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Queue {
    pub id: i64,
    pub name: String,
    pub schedule: Option<QueueSchedule>,
    pub query: Option<String>,
    pub connection_id: Option<i64>,
    pub previous_queue_id: Option<i64>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Queue {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            schedule: None,
            query: None,
            connection_id: None,
            previous_queue_id: None,
            tasks: Vec::new(),
        }
    }

    /// 设置任务列表并按 `order` 排序
    ///
    /// `order` 相同的任务按 id 排序，保证顺序确定。
    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self.sort_tasks();
        self
    }

    pub fn sort_tasks(&mut self) {
        self.tasks.sort_by_key(|t| (t.order, t.id));
    }

    pub fn has_chain(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// 是否需要通过数据源查询生成条目
    pub fn has_source(&self) -> bool {
        self.query.is_some() && self.connection_id.is_some()
    }

    pub fn first_task(&self) -> Option<&Task> {
        self.tasks.first()
    }

    /// 名称是否匹配 SQL `LIKE` 过滤模式，未配置过滤时总是匹配
    pub fn matches_filter(&self, pattern: Option<&str>) -> bool {
        pattern.map_or(true, |p| like_match(p, &self.name))
    }

    /// 队列自身的 Stream 名称（无任务链时使用）
    pub fn stream(&self) -> String {
        self.name.clone()
    }

    /// 指定任务的 Stream 名称
    pub fn task_stream(&self, task_name: &str) -> String {
        task_stream_name(&self.name, task_name)
    }
}

/// 任务 Stream 的命名规则：`<队列名>-<任务名>`
pub fn task_stream_name(queue_name: &str, task_name: &str) -> String {
    format!("{queue_name}-{task_name}")
}

/// SQL `LIKE` 模式匹配，支持 `%` 与 `_`
pub fn like_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    // dp[j]: 已处理的模式前缀是否匹配 value[..j]
    let mut dp = vec![false; v.len() + 1];
    dp[0] = true;
    for pc in &p {
        let mut next = vec![false; v.len() + 1];
        if *pc == '%' {
            let mut any = false;
            for j in 0..=v.len() {
                any = any || dp[j];
                next[j] = any;
            }
        } else {
            for j in 1..=v.len() {
                next[j] = dp[j - 1] && (*pc == '_' || *pc == v[j - 1]);
            }
        }
        dp = next;
    }
    dp[v.len()]
}
