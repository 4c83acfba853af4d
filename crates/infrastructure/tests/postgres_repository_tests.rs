use anyhow::Result;
use chrono::{Duration, Utc};
use queuer_core::{
    models::{Code, TaskOutcome, TaskRunTemplate},
    traits::{QueueRepository, RunRepository, SourceExecutor, TaskRunRepository},
};
use queuer_infrastructure::database::{
    PostgresQueueRepository, PostgresRunRepository, PostgresSourceExecutor,
    PostgresTaskRunRepository,
};
use queuer_testing_utils::DatabaseTestContainer;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::mpsc;

async fn insert_queue(pool: &PgPool, name: &str, previous: Option<i64>) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO queues (name, previous_queue_id) VALUES ($1, $2) RETURNING id",
    )
    .bind(name)
    .bind(previous)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

async fn insert_task(pool: &PgPool, queue_id: i64, name: &str, order: i32) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO tasks (queue_id, name, task_order, options) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(queue_id)
    .bind(name)
    .bind(order)
    .bind(json!({"retries": order}))
    .fetch_one(pool)
    .await?;
    Ok(id)
}

#[tokio::test]
#[ignore = "需要 Docker"]
async fn test_queue_repository_loads_tasks_and_dependents() -> Result<()> {
    let container = DatabaseTestContainer::new().await?;
    let pool = container.pool.clone();

    let upstream = insert_queue(&pool, "upstream", None).await?;
    insert_task(&pool, upstream, "second", 2).await?;
    insert_task(&pool, upstream, "first", 1).await?;
    let downstream = insert_queue(&pool, "downstream", Some(upstream)).await?;

    let repo = PostgresQueueRepository::new(pool);
    let queue = repo.get_by_id(upstream).await?.expect("queue exists");
    let names: Vec<_> = queue.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["first", "second"]);
    assert_eq!(queue.tasks[0].options.get("retries"), Some(&json!(1)));

    let dependents = repo.get_dependents(upstream).await?;
    assert_eq!(dependents.len(), 1);
    assert_eq!(dependents[0].id, downstream);

    assert_eq!(repo.get_by_name("upstream").await?.len(), 1);
    assert!(repo.get_by_id(9999).await?.is_none());
    Ok(())
}

#[tokio::test]
#[ignore = "需要 Docker"]
async fn test_schedule_due_and_advance() -> Result<()> {
    let container = DatabaseTestContainer::new().await?;
    let pool = container.pool.clone();
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO queues (name, schedule_cron, schedule_next) VALUES ('nightly', '0 0 * * *', $1), ('later', '0 0 * * *', $2), ('other', '0 0 * * *', NULL)",
    )
    .bind(now - Duration::minutes(1))
    .bind(now + Duration::hours(1))
    .execute(&pool)
    .await?;

    let repo = PostgresQueueRepository::new(pool);
    let due = repo.get_due_scheduled(now, None).await?;
    let names: Vec<_> = due.iter().map(|q| q.name.as_str()).collect();
    assert_eq!(names, vec!["nightly", "other"]);

    let filtered = repo.get_due_scheduled(now, Some("night%")).await?;
    assert_eq!(filtered.len(), 1);

    let nightly = &filtered[0];
    let expected = nightly.schedule.as_ref().and_then(|s| s.next);
    let next = now + Duration::days(1);
    assert!(repo.advance_schedule(nightly.id, expected, next).await?);
    // 同一个期望值只能推进一次
    assert!(!repo.advance_schedule(nightly.id, expected, next).await?);
    Ok(())
}

#[tokio::test]
#[ignore = "需要 Docker"]
async fn test_chained_item_settles_once_and_credits_run() -> Result<()> {
    let container = DatabaseTestContainer::new().await?;
    let pool = container.pool.clone();

    let queue_id = insert_queue(&pool, "chain", None).await?;
    let first = insert_task(&pool, queue_id, "first", 1).await?;
    let second = insert_task(&pool, queue_id, "second", 2).await?;

    let queues = PostgresQueueRepository::new(pool.clone());
    let runs = PostgresRunRepository::new(pool.clone());
    let task_runs = PostgresTaskRunRepository::new(pool.clone());

    let queue = queues.get_by_id(queue_id).await?.expect("queue exists");
    let run = runs.create(&queue, &json!({"k": 1})).await?;
    let templates: Vec<TaskRunTemplate> = queue.tasks.iter().map(TaskRunTemplate::from).collect();

    runs.increment_total(run.id, 1).await?;
    let item = task_runs
        .create_item(run.id, &json!({"k": 1}), &templates)
        .await?;
    let sealed = runs.finalize_total(run.id, 1).await?;
    assert_eq!(sealed.status, Code::Pending);
    assert!(sealed.sealed);

    let head = item.first_task_run().expect("first task run").clone();
    assert_eq!(head.task_id, first);

    assert!(task_runs.mark_started(head.id, "1-0", "host-a").await?.is_some());
    assert!(task_runs.mark_started(head.id, "1-0", "host-a").await?.is_some());
    assert!(task_runs.mark_started(head.id, "9-0", "host-b").await?.is_none());

    let run_after_first = task_runs
        .settle(head.id, &TaskOutcome::ok(json!({"step": 1})))
        .await?
        .expect("run returned");
    assert_eq!(run_after_first.aggr_ok, 0);
    assert!(task_runs.settle(head.id, &TaskOutcome::ok(json!(null))).await?.is_none());

    let unit = task_runs.get_unit(head.id).await?.expect("unit exists");
    let next = unit.next.expect("next task run");
    assert_eq!(next.task_id, second);

    let unit = task_runs.get_unit(next.id).await?.expect("unit exists");
    assert_eq!(unit.previous_result, Some(json!({"step": 1})));
    assert_eq!(unit.payload, json!({"k": 1}));

    task_runs.mark_started(next.id, "2-0", "host-a").await?;
    let finished = task_runs
        .settle(next.id, &TaskOutcome::ok(json!(null)))
        .await?
        .expect("run returned");
    assert_eq!(finished.status, Code::Ok);
    assert_eq!(finished.aggr_ok, 1);
    assert_eq!(finished.task_id, Some(second));

    assert!(!runs.claim_completion(run.id, Some(first)).await?);
    assert!(runs.claim_completion(run.id, Some(second)).await?);
    assert!(!runs.claim_completion(run.id, Some(second)).await?);
    Ok(())
}

#[tokio::test]
#[ignore = "需要 Docker"]
async fn test_equal_order_tasks_follow_each_other() -> Result<()> {
    let container = DatabaseTestContainer::new().await?;
    let pool = container.pool.clone();

    let queue_id = insert_queue(&pool, "tied", None).await?;
    let first = insert_task(&pool, queue_id, "a", 1).await?;
    let second = insert_task(&pool, queue_id, "b", 1).await?;

    let queues = PostgresQueueRepository::new(pool.clone());
    let runs = PostgresRunRepository::new(pool.clone());
    let task_runs = PostgresTaskRunRepository::new(pool.clone());

    let queue = queues.get_by_id(queue_id).await?.expect("queue exists");
    let run = runs.create(&queue, &json!({})).await?;
    let templates: Vec<TaskRunTemplate> = queue.tasks.iter().map(TaskRunTemplate::from).collect();
    runs.increment_total(run.id, 1).await?;
    let item = task_runs.create_item(run.id, &json!({}), &templates).await?;
    runs.finalize_total(run.id, 1).await?;

    let head = item.first_task_run().expect("first task run").clone();
    assert_eq!(head.task_id, first);
    task_runs.mark_started(head.id, "1-0", "host-a").await?;
    let after_head = task_runs
        .settle(head.id, &TaskOutcome::ok(json!({"from": "a"})))
        .await?
        .expect("run returned");
    // 第一个任务结束时条目尚未完成
    assert_eq!(after_head.aggr_ok, 0);

    let unit = task_runs.get_unit(head.id).await?.expect("unit exists");
    let next = unit.next.expect("tied task is next");
    assert_eq!(next.task_id, second);

    let unit = task_runs.get_unit(next.id).await?.expect("unit exists");
    assert_eq!(unit.previous_result, Some(json!({"from": "a"})));
    assert!(unit.next.is_none());

    task_runs.mark_started(next.id, "2-0", "host-a").await?;
    let finished = task_runs
        .settle(next.id, &TaskOutcome::ok(json!(null)))
        .await?
        .expect("run returned");
    assert_eq!(finished.status, Code::Ok);
    assert_eq!(finished.aggr_ok, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "需要 Docker"]
async fn test_record_outcome_and_sealing_order() -> Result<()> {
    let container = DatabaseTestContainer::new().await?;
    let pool = container.pool.clone();
    let queue_id = insert_queue(&pool, "plain", None).await?;

    let queues = PostgresQueueRepository::new(pool.clone());
    let runs = PostgresRunRepository::new(pool.clone());
    let queue = queues.get_by_id(queue_id).await?.expect("queue exists");

    let run = runs.create(&queue, &json!(null)).await?;
    runs.increment_total(run.id, 2).await?;

    let after_ok = runs.record_outcome(run.id, "1-0", true).await?.expect("pending");
    assert_eq!(after_ok.status, Code::Pending);
    assert!(runs.entry_recorded(run.id, "1-0").await?);

    // 重投递的同一条目不会重复计数
    assert!(runs.record_outcome(run.id, "1-0", true).await?.is_none());
    assert!(!runs.entry_recorded(run.id, "2-0").await?);

    let after_err = runs.record_outcome(run.id, "2-0", false).await?.expect("pending");
    // 尚未封存，计数齐全也不能结束
    assert_eq!(after_err.status, Code::Pending);
    assert_eq!((after_err.aggr_ok, after_err.aggr_err), (1, 1));

    let sealed = runs.finalize_total(run.id, 2).await?;
    assert_eq!(sealed.status, Code::Err);
    assert!(runs.record_outcome(run.id, "3-0", true).await?.is_none());
    assert!(!runs.entry_recorded(run.id, "3-0").await?);

    let empty = runs.create(&queue, &json!(null)).await?;
    let sealed_empty = runs.finalize_total(empty.id, 0).await?;
    assert_eq!(sealed_empty.status, Code::Ok);

    assert!(runs.record_outcome(424242, "1-0", true).await.is_err());
    Ok(())
}

#[tokio::test]
#[ignore = "需要 Docker"]
async fn test_source_executor_streams_rows() -> Result<()> {
    let container = DatabaseTestContainer::new().await?;
    let queues = PostgresQueueRepository::new(container.pool.clone());
    sqlx::query("INSERT INTO connections (name, dsn) VALUES ('self', $1)")
        .bind(&container.url)
        .execute(&container.pool)
        .await?;
    let connection = queues.get_connection(1).await?.expect("connection exists");

    let executor = PostgresSourceExecutor::default();
    let (tx, mut rx) = mpsc::channel(2);
    let query = "SELECT g AS n, $1::TEXT AS tag FROM generate_series(1, 5) AS g";
    let params = json!(["x"]);

    let (sent, rows) = tokio::join!(
        executor.stream_rows(&connection, query, &params, tx),
        async {
            let mut rows = Vec::new();
            while let Some(row) = rx.recv().await {
                rows.push(row);
            }
            rows
        }
    );

    assert_eq!(sent?, 5);
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0], json!({"n": 1, "tag": "x"}));
    Ok(())
}
