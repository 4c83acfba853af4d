use async_trait::async_trait;
use queuer_core::{
    models::{Queue, Run},
    traits::RunRepository,
    QueuerError, QueuerResult,
};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument};

pub(crate) const RUN_COLUMNS: &str = "id, queue_id, name, aggr_total, aggr_ok, aggr_err, status, task_id, sealed, completion_claimed, payload, created_at, updated_at";

/// 原子地记录一个结果并重新推导状态
///
/// `$2`/`$3` 分别为 ok/err 的增量（0 或 1），`$4` 为结算的任务 id。
/// SET 子句中的列引用均为更新前的值。
pub(crate) const CREDIT_RUN_SQL: &str = r#"
    UPDATE runs SET
        aggr_ok = aggr_ok + $2,
        aggr_err = aggr_err + $3,
        task_id = COALESCE($4, task_id),
        status = CASE
            WHEN sealed AND aggr_ok + aggr_err + 1 = aggr_total
                THEN CASE WHEN aggr_err + $3 > 0 THEN 'err' ELSE 'ok' END
            ELSE status
        END,
        updated_at = NOW()
    WHERE id = $1 AND status = 'pending'
    RETURNING id, queue_id, name, aggr_total, aggr_ok, aggr_err, status, task_id, sealed, completion_claimed, payload, created_at, updated_at
"#;

pub(crate) fn row_to_run(row: &sqlx::postgres::PgRow) -> QueuerResult<Run> {
    Ok(Run {
        id: row.try_get("id")?,
        queue_id: row.try_get("queue_id")?,
        name: row.try_get("name")?,
        aggr_total: row.try_get("aggr_total")?,
        aggr_ok: row.try_get("aggr_ok")?,
        aggr_err: row.try_get("aggr_err")?,
        status: row.try_get("status")?,
        task_id: row.try_get("task_id")?,
        sealed: row.try_get("sealed")?,
        completion_claimed: row.try_get("completion_claimed")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) async fn fetch_run<'e, E>(executor: E, id: i64) -> QueuerResult<Option<Run>>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(row_to_run).transpose()
}

pub struct PostgresRunRepository {
    pool: PgPool,
}

impl PostgresRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for PostgresRunRepository {
    #[instrument(skip(self, queue, payload), fields(queue_id = %queue.id, queue_name = %queue.name))]
    async fn create(&self, queue: &Queue, payload: &Value) -> QueuerResult<Run> {
        let row = sqlx::query(&format!(
            "INSERT INTO runs (queue_id, name, payload) VALUES ($1, $2, $3) RETURNING {RUN_COLUMNS}"
        ))
        .bind(queue.id)
        .bind(&queue.name)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        let run = row_to_run(&row)?;
        debug!("创建运行实例成功: ID {}, 队列: {}", run.id, queue.name);
        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %id))]
    async fn get_by_id(&self, id: i64) -> QueuerResult<Option<Run>> {
        fetch_run(&self.pool, id).await
    }

    #[instrument(skip(self))]
    async fn increment_total(&self, run_id: i64, by: i64) -> QueuerResult<()> {
        let result = sqlx::query(
            "UPDATE runs SET aggr_total = aggr_total + $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(run_id)
        .bind(by)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueuerError::RunNotFound { id: run_id });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn finalize_total(&self, run_id: i64, total: i64) -> QueuerResult<Run> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE runs SET
                aggr_total = $2,
                sealed = TRUE,
                status = CASE
                    WHEN status = 'pending' AND aggr_ok + aggr_err = $2
                        THEN CASE WHEN aggr_err > 0 THEN 'err' ELSE 'ok' END
                    ELSE status
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(total)
        .fetch_optional(&self.pool)
        .await?;

        let run = row
            .as_ref()
            .map(row_to_run)
            .transpose()?
            .ok_or(QueuerError::RunNotFound { id: run_id })?;
        info!(
            "运行实例 {} 已封存: 总数 {}, 成功 {}, 失败 {}, 状态 {}",
            run.id, run.aggr_total, run.aggr_ok, run.aggr_err, run.status
        );
        Ok(run)
    }

    #[instrument(skip(self))]
    async fn record_outcome(
        &self,
        run_id: i64,
        entry: &str,
        success: bool,
    ) -> QueuerResult<Option<Run>> {
        let (ok, err) = if success { (1i64, 0i64) } else { (0, 1) };
        let mut tx = self.pool.begin().await?;

        let registered = sqlx::query(
            r#"
            INSERT INTO run_entries (run_id, entry, code)
            SELECT id, $2, $3 FROM runs WHERE id = $1
            ON CONFLICT (run_id, entry) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(entry)
        .bind(if success { "ok" } else { "err" })
        .execute(&mut *tx)
        .await?;

        if registered.rows_affected() == 0 {
            let exists = fetch_run(&mut *tx, run_id).await?.is_some();
            tx.rollback().await?;
            if !exists {
                return Err(QueuerError::RunNotFound { id: run_id });
            }
            debug!("运行实例 {} 的条目 {} 已记账，忽略", run_id, entry);
            return Ok(None);
        }

        let row = sqlx::query(CREDIT_RUN_SQL)
            .bind(run_id)
            .bind(ok)
            .bind(err)
            .bind(Option::<i64>::None)
            .fetch_optional(&mut *tx)
            .await?;

        match row {
            Some(row) => {
                let run = row_to_run(&row)?;
                tx.commit().await?;
                Ok(Some(run))
            }
            None => {
                tx.rollback().await?;
                debug!("运行实例 {} 已结束，忽略结果", run_id);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    async fn entry_recorded(&self, run_id: i64, entry: &str) -> QueuerResult<bool> {
        let row = sqlx::query("SELECT 1 FROM run_entries WHERE run_id = $1 AND entry = $2")
            .bind(run_id)
            .bind(entry)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn claim_completion(&self, run_id: i64, task_id: Option<i64>) -> QueuerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET completion_claimed = TRUE, updated_at = NOW()
            WHERE id = $1
              AND status <> 'pending'
              AND NOT completion_claimed
              AND ($2::BIGINT IS NULL OR task_id = $2)
            "#,
        )
        .bind(run_id)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
