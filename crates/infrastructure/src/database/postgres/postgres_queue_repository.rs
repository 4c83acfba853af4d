use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuer_core::{
    models::{Queue, QueueSchedule, SourceConnection, Task, TaskRunOptions},
    traits::QueueRepository,
    QueuerResult,
};
use sqlx::{types::Json, PgPool, Row};
use tracing::{debug, instrument};

const QUEUE_COLUMNS: &str = "id, name, schedule_cron, schedule_begin, schedule_end, schedule_next, query, connection_id, previous_queue_id";

pub struct PostgresQueueRepository {
    pool: PgPool,
}

impl PostgresQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_queue(row: &sqlx::postgres::PgRow) -> QueuerResult<Queue> {
        let cron: Option<String> = row.try_get("schedule_cron")?;
        let schedule = match cron {
            Some(cron) => Some(QueueSchedule {
                cron,
                begin: row.try_get("schedule_begin")?,
                end: row.try_get("schedule_end")?,
                next: row.try_get("schedule_next")?,
            }),
            None => None,
        };
        Ok(Queue {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            schedule,
            query: row.try_get("query")?,
            connection_id: row.try_get("connection_id")?,
            previous_queue_id: row.try_get("previous_queue_id")?,
            tasks: Vec::new(),
        })
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> QueuerResult<Task> {
        let options: Json<TaskRunOptions> = row.try_get("options")?;
        Ok(Task {
            id: row.try_get("id")?,
            queue_id: row.try_get("queue_id")?,
            name: row.try_get("name")?,
            order: row.try_get("task_order")?,
            options: options.0,
        })
    }

    /// 批量加载任务并挂到对应队列上
    async fn with_tasks(&self, mut queues: Vec<Queue>) -> QueuerResult<Vec<Queue>> {
        if queues.is_empty() {
            return Ok(queues);
        }
        let ids: Vec<i64> = queues.iter().map(|q| q.id).collect();
        let rows = sqlx::query(
            "SELECT id, queue_id, name, task_order, options FROM tasks WHERE queue_id = ANY($1) ORDER BY queue_id, task_order, id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_queue: HashMap<i64, Vec<Task>> = HashMap::new();
        for row in &rows {
            let task = Self::row_to_task(row)?;
            by_queue.entry(task.queue_id).or_default().push(task);
        }
        for queue in &mut queues {
            queue.tasks = by_queue.remove(&queue.id).unwrap_or_default();
            queue.sort_tasks();
        }
        Ok(queues)
    }

    async fn fetch_queues(&self, rows: Vec<sqlx::postgres::PgRow>) -> QueuerResult<Vec<Queue>> {
        let queues = rows
            .iter()
            .map(Self::row_to_queue)
            .collect::<QueuerResult<Vec<_>>>()?;
        self.with_tasks(queues).await
    }
}

#[async_trait]
impl QueueRepository for PostgresQueueRepository {
    #[instrument(skip(self), fields(queue_id = %id))]
    async fn get_by_id(&self, id: i64) -> QueuerResult<Option<Queue>> {
        let row = sqlx::query(&format!("SELECT {QUEUE_COLUMNS} FROM queues WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(self.fetch_queues(vec![row]).await?.pop()),
            None => {
                debug!("队列不存在: ID {}", id);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_by_name(&self, name: &str) -> QueuerResult<Vec<Queue>> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queues WHERE name = $1 ORDER BY id"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        self.fetch_queues(rows).await
    }

    #[instrument(skip(self))]
    async fn get_due_scheduled(
        &self,
        now: DateTime<Utc>,
        name_filter: Option<&str>,
    ) -> QueuerResult<Vec<Queue>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {QUEUE_COLUMNS} FROM queues
            WHERE schedule_cron IS NOT NULL
              AND (schedule_begin IS NULL OR schedule_begin <= $1)
              AND (schedule_end IS NULL OR $1 <= schedule_end)
              AND (schedule_next IS NULL OR schedule_next <= $1)
              AND ($2::TEXT IS NULL OR name LIKE $2)
            ORDER BY id
            "#
        ))
        .bind(now)
        .bind(name_filter)
        .fetch_all(&self.pool)
        .await?;

        let queues = self.fetch_queues(rows).await?;
        debug!("找到 {} 个到期的定时队列", queues.len());
        Ok(queues)
    }

    #[instrument(skip(self))]
    async fn advance_schedule(
        &self,
        queue_id: i64,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> QueuerResult<bool> {
        let result = sqlx::query(
            "UPDATE queues SET schedule_next = $3, updated_at = NOW() WHERE id = $1 AND schedule_next IS NOT DISTINCT FROM $2",
        )
        .bind(queue_id)
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get_dependents(&self, queue_id: i64) -> QueuerResult<Vec<Queue>> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queues WHERE previous_queue_id = $1 ORDER BY id"
        ))
        .bind(queue_id)
        .fetch_all(&self.pool)
        .await?;
        self.fetch_queues(rows).await
    }

    #[instrument(skip(self))]
    async fn get_connection(&self, id: i64) -> QueuerResult<Option<SourceConnection>> {
        let row = sqlx::query("SELECT id, name, dsn FROM connections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> QueuerResult<SourceConnection> {
            Ok(SourceConnection {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                dsn: row.try_get("dsn")?,
            })
        })
        .transpose()
    }
}
