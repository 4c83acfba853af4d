use async_trait::async_trait;
use queuer_core::{
    models::{
        Code, Item, Run, TaskOutcome, TaskRun, TaskRunOptions, TaskRunTemplate, TaskRunUnit,
    },
    traits::TaskRunRepository,
    QueuerError, QueuerResult,
};
use serde_json::Value;
use sqlx::{types::Json, PgPool, Row};
use tracing::{debug, instrument};

use super::postgres_run_repository::{fetch_run, row_to_run, CREDIT_RUN_SQL};

const TASK_RUN_COLUMNS: &str = "id, item_id, run_id, task_id, name, task_order, code, started, xid, reason, result, options, host";

pub struct PostgresTaskRunRepository {
    pool: PgPool,
}

impl PostgresTaskRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task_run(row: &sqlx::postgres::PgRow) -> QueuerResult<TaskRun> {
        let options: Json<TaskRunOptions> = row.try_get("options")?;
        Ok(TaskRun {
            id: row.try_get("id")?,
            item_id: row.try_get("item_id")?,
            run_id: row.try_get("run_id")?,
            task_id: row.try_get("task_id")?,
            name: row.try_get("name")?,
            order: row.try_get("task_order")?,
            code: row.try_get("code")?,
            started: row.try_get("started")?,
            xid: row.try_get("xid")?,
            reason: row.try_get("reason")?,
            result: row.try_get("result")?,
            options: options.0,
            host: row.try_get("host")?,
        })
    }

    async fn task_run_exists(&self, id: i64) -> QueuerResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM task_runs WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl TaskRunRepository for PostgresTaskRunRepository {
    #[instrument(skip(self, payload, templates), fields(run_id = %run_id, tasks = templates.len()))]
    async fn create_item(
        &self,
        run_id: i64,
        payload: &Value,
        templates: &[TaskRunTemplate],
    ) -> QueuerResult<Item> {
        let mut tx = self.pool.begin().await?;

        let item_id: i64 =
            sqlx::query_scalar("INSERT INTO items (run_id, payload) VALUES ($1, $2) RETURNING id")
                .bind(run_id)
                .bind(payload)
                .fetch_one(&mut *tx)
                .await?;

        let mut task_runs = Vec::with_capacity(templates.len());
        for template in templates {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO task_runs (item_id, run_id, task_id, name, task_order, options)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING {TASK_RUN_COLUMNS}
                "#
            ))
            .bind(item_id)
            .bind(run_id)
            .bind(template.task_id)
            .bind(&template.name)
            .bind(template.order)
            .bind(Json(&template.options))
            .fetch_one(&mut *tx)
            .await?;
            task_runs.push(Self::row_to_task_run(&row)?);
        }

        tx.commit().await?;
        debug!("创建条目成功: ID {}, 任务运行实例 {} 个", item_id, task_runs.len());

        Ok(Item {
            id: item_id,
            run_id,
            payload: payload.clone(),
            code: Code::Pending,
            task_runs,
        })
    }

    #[instrument(skip(self))]
    async fn get_unit(&self, task_run_id: i64) -> QueuerResult<Option<TaskRunUnit>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_RUN_COLUMNS} FROM task_runs WHERE id = $1"
        ))
        .bind(task_run_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let task_run = Self::row_to_task_run(&row)?;

        let payload: Value = sqlx::query_scalar("SELECT payload FROM items WHERE id = $1")
            .bind(task_run.item_id)
            .fetch_one(&self.pool)
            .await?;

        let run = fetch_run(&self.pool, task_run.run_id)
            .await?
            .ok_or(QueuerError::RunNotFound {
                id: task_run.run_id,
            })?;

        let previous_result: Option<Option<Value>> = sqlx::query_scalar(
            r#"
            SELECT result FROM task_runs
            WHERE item_id = $1 AND (task_order, id) < ($2, $3)
            ORDER BY task_order DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(task_run.item_id)
        .bind(task_run.order)
        .bind(task_run.id)
        .fetch_optional(&self.pool)
        .await?;

        let next = sqlx::query(&format!(
            r#"
            SELECT {TASK_RUN_COLUMNS} FROM task_runs
            WHERE item_id = $1 AND (task_order, id) > ($2, $3)
            ORDER BY task_order, id
            LIMIT 1
            "#
        ))
        .bind(task_run.item_id)
        .bind(task_run.order)
        .bind(task_run.id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(Self::row_to_task_run)
        .transpose()?;

        Ok(Some(TaskRunUnit {
            task_run,
            run,
            payload,
            previous_result: previous_result.flatten(),
            next,
        }))
    }

    #[instrument(skip(self))]
    async fn mark_started(
        &self,
        task_run_id: i64,
        xid: &str,
        host: &str,
    ) -> QueuerResult<Option<TaskRun>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE task_runs SET started = NOW(), xid = $2, host = $3, updated_at = NOW()
            WHERE id = $1 AND code = 'pending' AND (xid IS NULL OR xid = $2)
            RETURNING {TASK_RUN_COLUMNS}
            "#
        ))
        .bind(task_run_id)
        .bind(xid)
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_task_run(&row)?)),
            None => {
                debug!("任务运行实例 {} 已被处理或被其他条目认领", task_run_id);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, outcome), fields(code = %outcome.code))]
    async fn settle(&self, task_run_id: i64, outcome: &TaskOutcome) -> QueuerResult<Option<Run>> {
        if outcome.code == Code::Pending {
            return Err(QueuerError::Validation(
                "结算结果不能为 pending".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE task_runs SET code = $2, reason = $3, result = $4, updated_at = NOW()
            WHERE id = $1 AND code = 'pending'
            RETURNING {TASK_RUN_COLUMNS}
            "#
        ))
        .bind(task_run_id)
        .bind(outcome.code)
        .bind(&outcome.reason)
        .bind(&outcome.result)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            if !self.task_run_exists(task_run_id).await? {
                return Err(QueuerError::TaskRunNotFound { id: task_run_id });
            }
            debug!("任务运行实例 {} 已结算，跳过", task_run_id);
            return Ok(None);
        };
        let task_run = Self::row_to_task_run(&row)?;

        // 顺序相同的任务按 id 排列，与加载任务链的顺序一致
        let is_last: bool = sqlx::query_scalar(
            r#"
            SELECT NOT EXISTS(
                SELECT 1 FROM task_runs
                WHERE item_id = $1 AND (task_order, id) > ($2, $3)
            )
            "#,
        )
        .bind(task_run.item_id)
        .bind(task_run.order)
        .bind(task_run.id)
        .fetch_one(&mut *tx)
        .await?;

        if outcome.is_ok() && !is_last {
            let run = fetch_run(&mut *tx, task_run.run_id).await?;
            tx.commit().await?;
            return Ok(run);
        }

        sqlx::query("UPDATE items SET code = $2 WHERE id = $1")
            .bind(task_run.item_id)
            .bind(outcome.code)
            .execute(&mut *tx)
            .await?;

        let (ok, err) = if outcome.is_ok() { (1i64, 0i64) } else { (0, 1) };
        let credited = sqlx::query(CREDIT_RUN_SQL)
            .bind(task_run.run_id)
            .bind(ok)
            .bind(err)
            .bind(Some(task_run.task_id))
            .fetch_optional(&mut *tx)
            .await?;

        let run = match credited {
            Some(row) => Some(row_to_run(&row)?),
            None => fetch_run(&mut *tx, task_run.run_id).await?,
        };

        tx.commit().await?;
        Ok(run)
    }
}
