//! 测试数据构建器

use chrono::{DateTime, Utc};
use queuer_core::models::{Queue, QueueSchedule, Task};
use serde_json::Value;

/// 队列构建器
///
/// 任务 id 从 `队列id * 100 + 1` 开始自动分配。
pub struct QueueBuilder {
    queue: Queue,
}

impl QueueBuilder {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            queue: Queue::new(id, name),
        }
    }

    pub fn with_schedule(mut self, cron: &str, next: Option<DateTime<Utc>>) -> Self {
        let mut schedule = QueueSchedule::new(cron);
        schedule.next = next;
        self.queue.schedule = Some(schedule);
        self
    }

    pub fn with_window(mut self, begin: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        let schedule = self
            .queue
            .schedule
            .get_or_insert_with(|| QueueSchedule::new("* * * * *"));
        schedule.begin = begin;
        schedule.end = end;
        self
    }

    pub fn with_query(mut self, query: &str, connection_id: i64) -> Self {
        self.queue.query = Some(query.to_string());
        self.queue.connection_id = Some(connection_id);
        self
    }

    pub fn with_previous(mut self, queue_id: i64) -> Self {
        self.queue.previous_queue_id = Some(queue_id);
        self
    }

    pub fn with_task(mut self, name: &str, order: i32) -> Self {
        let id = self.queue.id * 100 + self.queue.tasks.len() as i64 + 1;
        self.queue.tasks.push(Task::new(id, self.queue.id, name, order));
        self
    }

    pub fn with_task_option(mut self, name: &str, value: Value) -> Self {
        if let Some(task) = self.queue.tasks.last_mut() {
            task.options.insert(name.to_string(), value);
        }
        self
    }

    pub fn build(mut self) -> Queue {
        self.queue.sort_tasks();
        self.queue
    }
}

/// 任务构建器
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task::new(1, 1, "test_task", 1),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.task.id = id;
        self
    }

    pub fn with_queue_id(mut self, queue_id: i64) -> Self {
        self.task.queue_id = queue_id;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.task.order = order;
        self
    }

    pub fn with_option(mut self, name: &str, value: Value) -> Self {
        self.task.options.insert(name.to_string(), value);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}
