use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use queuer_core::{
    config::TaskSchemas,
    models::{task_stream_name, Code, Queue, Run, StreamMessage, TaskRunTemplate, WorkUnit},
    traits::{
        ReadRequest, RunRepository, StreamTransport, TaskHandler, TaskRunRepository, TaskWorker,
    },
    CompletionNotifier, QueuerError, QueuerResult,
};
use queuer_testing_utils::{
    FnHandler, InMemoryStreamTransport, InMemoryTriggerChannel, MockDatabase, QueueBuilder,
    TaskRunEvent, TestEnv,
};
use queuer_worker::TaskRunner;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    db: MockDatabase,
    transport: InMemoryStreamTransport,
    trigger: InMemoryTriggerChannel,
    notifier: Arc<CompletionNotifier>,
}

impl Harness {
    fn new() -> Self {
        let db = MockDatabase::new();
        let trigger = InMemoryTriggerChannel::new();
        let notifier = Arc::new(CompletionNotifier::new(
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            Arc::new(trigger.clone()),
        ));
        Self {
            db,
            transport: InMemoryStreamTransport::new(),
            trigger,
            notifier,
        }
    }

    fn runner(&self, stream: &str, task: &str, handler: Arc<dyn TaskHandler>) -> TaskRunner {
        self.builder(stream, task, handler).build().unwrap()
    }

    fn builder(
        &self,
        stream: &str,
        task: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> queuer_worker::TaskRunnerBuilder {
        let db = Arc::new(self.db.clone());
        TaskRunner::builder(task)
            .stream(stream)
            .host("test-host")
            .concurrency(2)
            .block_timeout(Duration::from_millis(50))
            .drain_poll_interval(Duration::from_millis(10))
            .reclaim_idle(None)
            .handler(handler)
            .runs(db.clone())
            .task_runs(db)
            .transport(Arc::new(self.transport.clone()))
            .notifier(self.notifier.clone())
    }

    /// 创建运行实例和条目，把第一个任务写入 Stream 并封存
    async fn seed_chain(&self, queue: &Queue, payloads: Vec<Value>) -> Run {
        let run = self.db.create(queue, &Value::Null).await.unwrap();
        let templates: Vec<TaskRunTemplate> = queue.tasks.iter().map(TaskRunTemplate::from).collect();
        let total = payloads.len() as i64;
        for payload in payloads {
            let item = self.db.create_item(run.id, &payload, &templates).await.unwrap();
            self.db.increment_total(run.id, 1).await.unwrap();
            let first = &item.task_runs[0];
            self.transport
                .push(
                    &queue.task_stream(&first.name),
                    &StreamMessage::task_run(first.id),
                )
                .await
                .unwrap();
        }
        self.db.finalize_total(run.id, total).await.unwrap()
    }

    async fn seed_plain(&self, queue: &Queue, payloads: Vec<Value>) -> Run {
        let run = self.db.create(queue, &Value::Null).await.unwrap();
        let total = payloads.len() as i64;
        for payload in payloads {
            self.db.increment_total(run.id, 1).await.unwrap();
            self.transport
                .push(&queue.stream(), &StreamMessage::payload(queue.id, run.id, payload))
                .await
                .unwrap();
        }
        self.db.finalize_total(run.id, total).await.unwrap()
    }

    async fn wait_for_status(&self, run_id: i64) -> Code {
        let db = self.db.clone();
        TestEnv::wait_until(
            || db.run(run_id).is_some_and(|r| r.status != Code::Pending),
            WAIT,
        )
        .await;
        self.db.run(run_id).map(|r| r.status).unwrap_or(Code::Pending)
    }
}

fn chain_queue() -> Queue {
    QueueBuilder::new(1, "orders")
        .with_task("fetch", 1)
        .with_task("store", 2)
        .build()
}

#[tokio::test]
async fn test_chain_completes_and_passes_previous_result() {
    let h = Harness::new();
    let queue = h.db.insert_queue(chain_queue());
    h.db.insert_queue(QueueBuilder::new(2, "report").with_previous(1).build());

    let fetch = FnHandler::new(|unit| Ok(json!({"fetched": unit.payload["id"]})));
    let store = FnHandler::echo();
    let fetch_runner = h.runner("orders-fetch", "fetch", Arc::new(fetch.clone()));
    let store_runner = h.runner("orders-store", "store", Arc::new(store.clone()));
    fetch_runner.start().await.unwrap();
    store_runner.start().await.unwrap();

    let run = h
        .seed_chain(&queue, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})])
        .await;
    assert_eq!(h.wait_for_status(run.id).await, Code::Ok);

    fetch_runner.stop().await.unwrap();
    store_runner.stop().await.unwrap();

    let run = h.db.run(run.id).unwrap();
    assert_eq!((run.aggr_total, run.aggr_ok, run.aggr_err), (3, 3, 0));

    let mut previous: Vec<_> = store
        .units()
        .iter()
        .map(|u| u.previous_result.clone().unwrap())
        .collect();
    previous.sort_by_key(|v| v["fetched"].as_i64());
    assert_eq!(
        previous,
        vec![json!({"fetched": 1}), json!({"fetched": 2}), json!({"fetched": 3})]
    );
    assert!(fetch.units().iter().all(|u| u.host == "test-host"));

    assert!(h
        .db
        .task_runs(run.id)
        .iter()
        .all(|tr| tr.code == Code::Ok && tr.host.as_deref() == Some("test-host")));

    let published = h.trigger.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].queue_id, Some(2));
    assert_eq!(published[0].run_payload(), json!(run.id));
}

#[tokio::test]
async fn test_next_task_starts_only_after_previous_succeeded() {
    let h = Harness::new();
    let queue = h.db.insert_queue(chain_queue());
    let fetch_runner = h.runner("orders-fetch", "fetch", Arc::new(FnHandler::echo()));
    let store_runner = h.runner("orders-store", "store", Arc::new(FnHandler::echo()));
    fetch_runner.start().await.unwrap();
    store_runner.start().await.unwrap();

    let run = h
        .seed_chain(&queue, (0..5).map(|i| json!({"id": i})).collect())
        .await;
    assert_eq!(h.wait_for_status(run.id).await, Code::Ok);
    fetch_runner.stop().await.unwrap();
    store_runner.stop().await.unwrap();

    let events = h.db.events();
    for item in h.db.items(run.id) {
        let settled_first = events.iter().position(|e| {
            matches!(e, TaskRunEvent::Settled { item_id, order: 1, code: Code::Ok, .. } if *item_id == item.id)
        });
        let started_second = events.iter().position(|e| {
            matches!(e, TaskRunEvent::Started { item_id, order: 2, .. } if *item_id == item.id)
        });
        assert!(settled_first.unwrap() < started_second.unwrap());
    }
}

#[tokio::test]
async fn test_failed_task_halts_chain_and_fails_run() {
    let h = Harness::new();
    let queue = h.db.insert_queue(chain_queue());
    let fetch = FnHandler::new(|unit| {
        if unit.payload["id"] == json!(2) {
            Err(QueuerError::task_execution("上游不可用"))
        } else {
            Ok(unit.payload.clone())
        }
    });
    let store = FnHandler::echo();
    let fetch_runner = h.runner("orders-fetch", "fetch", Arc::new(fetch));
    let store_runner = h.runner("orders-store", "store", Arc::new(store.clone()));
    fetch_runner.start().await.unwrap();
    store_runner.start().await.unwrap();

    let run = h
        .seed_chain(&queue, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})])
        .await;
    assert_eq!(h.wait_for_status(run.id).await, Code::Err);
    fetch_runner.stop().await.unwrap();
    store_runner.stop().await.unwrap();

    let run = h.db.run(run.id).unwrap();
    assert_eq!((run.aggr_ok, run.aggr_err), (2, 1));
    assert_eq!(store.units().len(), 2);

    let failed = h
        .db
        .items(run.id)
        .into_iter()
        .find(|i| i.payload == json!({"id": 2}))
        .unwrap();
    assert_eq!(failed.code, Code::Err);
    assert_eq!(failed.task_runs[0].code, Code::Err);
    assert_eq!(failed.task_runs[0].reason.as_deref(), Some("任务执行错误: 上游不可用"));
    assert_eq!(failed.task_runs[1].code, Code::Pending);
    assert!(failed.task_runs[1].started.is_none());
}

#[tokio::test]
async fn test_schema_violation_is_terminal_failure() {
    let h = Harness::new();
    let queue = h
        .db
        .insert_queue(QueueBuilder::new(1, "mail").with_task("send", 1).build());
    let handler = FnHandler::echo();
    let runner = h
        .builder("mail-send", "send", Arc::new(handler.clone()))
        .schemas(TaskSchemas {
            options: None,
            payload: Some(json!({"type": "object", "required": ["to"]})),
        })
        .build()
        .unwrap();
    runner.start().await.unwrap();

    let run = h
        .seed_chain(&queue, vec![json!({"to": "a@example.com"}), json!({"subject": "hi"})])
        .await;
    assert_eq!(h.wait_for_status(run.id).await, Code::Err);
    runner.stop().await.unwrap();

    assert_eq!(handler.units().len(), 1);
    let rejected = h
        .db
        .task_runs(run.id)
        .into_iter()
        .find(|tr| tr.code == Code::Err)
        .unwrap();
    assert!(rejected
        .reason
        .as_deref()
        .is_some_and(|r| r.starts_with("payload 校验失败")));
}

#[tokio::test]
async fn test_handler_panic_is_recorded_as_failure() {
    let h = Harness::new();
    let queue = h
        .db
        .insert_queue(QueueBuilder::new(1, "fragile").with_task("parse", 1).build());
    let handler = FnHandler::new(|unit| {
        if unit.payload == json!("bad") {
            panic!("无法解析");
        }
        Ok(json!("parsed"))
    });
    let runner = h.runner("fragile-parse", "parse", Arc::new(handler));
    runner.start().await.unwrap();

    let run = h.seed_chain(&queue, vec![json!("bad"), json!("good")]).await;
    assert_eq!(h.wait_for_status(run.id).await, Code::Err);
    runner.stop().await.unwrap();

    let run = h.db.run(run.id).unwrap();
    assert_eq!((run.aggr_ok, run.aggr_err), (1, 1));
    let reasons: Vec<_> = h
        .db
        .task_runs(run.id)
        .into_iter()
        .filter_map(|tr| tr.reason)
        .collect();
    assert_eq!(reasons, vec!["处理器异常: 无法解析".to_string()]);
    assert!(!runner.is_running());
}

#[tokio::test]
async fn test_redelivery_after_failed_ack_does_not_double_count() {
    let h = Harness::new();
    let queue = h
        .db
        .insert_queue(QueueBuilder::new(1, "once").with_task("work", 1).build());
    let handler = FnHandler::echo();
    let runner = h.runner("once-work", "work", Arc::new(handler.clone()));

    h.transport.fail_next_acks(1);
    let run = h.seed_chain(&queue, vec![json!({"n": 1})]).await;
    runner.start().await.unwrap();
    assert_eq!(h.wait_for_status(run.id).await, Code::Ok);
    runner.stop().await.unwrap();
    assert_eq!(h.transport.pending_count("once-work", "work"), 1);

    // 重启后先读取待确认条目
    runner.start().await.unwrap();
    let transport = h.transport.clone();
    assert!(TestEnv::wait_until(|| transport.pending_count("once-work", "work") == 0, WAIT).await);
    runner.stop().await.unwrap();

    let run = h.db.run(run.id).unwrap();
    assert_eq!((run.aggr_total, run.aggr_ok, run.aggr_err), (1, 1, 0));
    assert_eq!(handler.units().len(), 1);
}

#[tokio::test]
async fn test_redelivery_re_enqueues_missing_next_task() {
    let h = Harness::new();
    let queue = h.db.insert_queue(chain_queue());
    let run = h.db.create(&queue, &Value::Null).await.unwrap();
    let templates: Vec<TaskRunTemplate> = queue.tasks.iter().map(TaskRunTemplate::from).collect();
    let item = h.db.create_item(run.id, &json!({"id": 9}), &templates).await.unwrap();
    h.db.increment_total(run.id, 1).await.unwrap();
    h.db.finalize_total(run.id, 1).await.unwrap();

    // 模拟上次处理在结算之后、写入下一个任务之前中断
    let first = &item.task_runs[0];
    h.db.mark_started(first.id, "0-1", "crashed-host").await.unwrap();
    h.db
        .settle(first.id, &queuer_core::models::TaskOutcome::ok(json!({"step": 1})))
        .await
        .unwrap();
    h.transport
        .push("orders-fetch", &StreamMessage::task_run(first.id))
        .await
        .unwrap();

    let fetch = FnHandler::echo();
    let fetch_runner = h.runner("orders-fetch", "fetch", Arc::new(fetch.clone()));
    let store = FnHandler::echo();
    let store_runner = h.runner("orders-store", "store", Arc::new(store.clone()));
    fetch_runner.start().await.unwrap();
    store_runner.start().await.unwrap();

    assert_eq!(h.wait_for_status(run.id).await, Code::Ok);
    fetch_runner.stop().await.unwrap();
    store_runner.stop().await.unwrap();

    assert!(fetch.units().is_empty());
    let units = store.units();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].previous_result, Some(json!({"step": 1})));
}

#[tokio::test]
async fn test_duplicate_entries_for_same_task_run_execute_once() {
    let h = Harness::new();
    let queue = h
        .db
        .insert_queue(QueueBuilder::new(1, "dup").with_task("work", 1).build());
    let handler = FnHandler::echo().with_delay(Duration::from_millis(50));
    let runner = h.runner("dup-work", "work", Arc::new(handler.clone()));

    let run = h.seed_chain(&queue, vec![json!(1)]).await;
    let task_run_id = h.db.task_runs(run.id)[0].id;
    h.transport
        .push("dup-work", &StreamMessage::task_run(task_run_id))
        .await
        .unwrap();

    runner.start().await.unwrap();
    let transport = h.transport.clone();
    assert!(TestEnv::wait_until(|| transport.acked() == 2, WAIT).await);
    runner.stop().await.unwrap();

    assert_eq!(handler.units().len(), 1);
    let run = h.db.run(run.id).unwrap();
    assert_eq!((run.status, run.aggr_ok), (Code::Ok, 1));
}

#[tokio::test]
async fn test_chainless_queue_counts_entries() {
    let h = Harness::new();
    let queue = h.db.insert_queue(QueueBuilder::new(1, "plain").build());
    h.db.insert_queue(QueueBuilder::new(2, "after").with_previous(1).build());
    let handler = FnHandler::new(|unit| {
        if unit.payload["ok"] == json!(false) {
            Err(QueuerError::task_execution("拒绝"))
        } else {
            Ok(Value::Null)
        }
    });
    let runner = h.runner("plain", "plain", Arc::new(handler.clone()));
    runner.start().await.unwrap();

    let run = h
        .seed_plain(&queue, vec![json!({"ok": true}), json!({"ok": false})])
        .await;
    assert_eq!(h.wait_for_status(run.id).await, Code::Err);
    runner.stop().await.unwrap();

    let run = h.db.run(run.id).unwrap();
    assert_eq!((run.aggr_total, run.aggr_ok, run.aggr_err), (2, 1, 1));
    let units = handler.units();
    assert!(units.iter().all(|u| u.task_run_id.is_none() && u.run_id == run.id));
    assert_eq!(h.trigger.published().len(), 1);
}

#[tokio::test]
async fn test_chainless_redelivery_with_live_total_is_credited_once() {
    let h = Harness::new();
    let queue = h.db.insert_queue(QueueBuilder::new(1, "plain").build());
    let handler = FnHandler::echo();
    let runner = h.runner("plain", "plain", Arc::new(handler.clone()));

    // 生产尚未结束：总数已计入 2，只写入了第一个条目
    let run = h.db.create(&queue, &Value::Null).await.unwrap();
    h.db.increment_total(run.id, 2).await.unwrap();
    h.transport
        .push("plain", &StreamMessage::payload(queue.id, run.id, json!({"n": 1})))
        .await
        .unwrap();

    h.transport.fail_next_acks(1);
    runner.start().await.unwrap();
    let observed = h.db.clone();
    assert!(
        TestEnv::wait_until(
            || observed.run(run.id).is_some_and(|r| r.aggr_ok == 1),
            WAIT
        )
        .await
    );
    runner.stop().await.unwrap();
    assert_eq!(h.transport.pending_count("plain", "plain"), 1);

    // 重启后重投递同一条目，不再执行也不再计数
    runner.start().await.unwrap();
    let transport = h.transport.clone();
    assert!(TestEnv::wait_until(|| transport.pending_count("plain", "plain") == 0, WAIT).await);
    runner.stop().await.unwrap();

    let sealed = h.db.finalize_total(run.id, 2).await.unwrap();
    assert_eq!(handler.units().len(), 1);
    assert_eq!(
        (sealed.aggr_total, sealed.aggr_ok, sealed.aggr_err, sealed.status),
        (2, 1, 0, Code::Pending)
    );
}

#[tokio::test]
async fn test_tasks_with_equal_order_run_in_definition_order() {
    let h = Harness::new();
    let queue = h.db.insert_queue(
        QueueBuilder::new(1, "tied")
            .with_task("a", 1)
            .with_task("b", 1)
            .build(),
    );
    let a = FnHandler::new(|_| Ok(json!({"from": "a"})));
    let b = FnHandler::echo();
    let a_runner = h.runner("tied-a", "a", Arc::new(a.clone()));
    let b_runner = h.runner("tied-b", "b", Arc::new(b.clone()));
    a_runner.start().await.unwrap();
    b_runner.start().await.unwrap();

    let run = h.seed_chain(&queue, vec![json!({"id": 1})]).await;
    assert_eq!(h.wait_for_status(run.id).await, Code::Ok);
    a_runner.stop().await.unwrap();
    b_runner.stop().await.unwrap();

    assert_eq!(a.units().len(), 1);
    let units = b.units();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].previous_result, Some(json!({"from": "a"})));

    let codes: Vec<(String, Code)> = h
        .db
        .task_runs(run.id)
        .into_iter()
        .map(|tr| (tr.name, tr.code))
        .collect();
    assert_eq!(
        codes,
        vec![("a".to_string(), Code::Ok), ("b".to_string(), Code::Ok)]
    );
    assert_eq!(h.db.run(run.id).unwrap().aggr_ok, 1);
}

#[tokio::test]
async fn test_idle_entry_of_dead_consumer_is_reclaimed() {
    let h = Harness::new();
    let queue = h
        .db
        .insert_queue(QueueBuilder::new(1, "reclaim").with_task("work", 1).build());
    h.transport.ensure_group("reclaim-work", "work").await.unwrap();
    let run = h.seed_chain(&queue, vec![json!({"n": 1})]).await;

    // 另一个消费者读取后未确认就退出
    let taken = h
        .transport
        .read_group(&ReadRequest {
            stream: "reclaim-work".to_string(),
            group: "work".to_string(),
            consumer: "dead-host".to_string(),
            count: 10,
            block: Duration::from_millis(10),
            pending: false,
        })
        .await
        .unwrap();
    assert_eq!(taken.len(), 1);
    assert_eq!(h.transport.pending_count("reclaim-work", "work"), 1);

    let handler = FnHandler::echo();
    let runner = h
        .builder("reclaim-work", "work", Arc::new(handler.clone()))
        .consumer("live-host")
        .reclaim_idle(Some(Duration::from_millis(50)))
        .build()
        .unwrap();
    runner.start().await.unwrap();
    assert_eq!(h.wait_for_status(run.id).await, Code::Ok);
    let transport = h.transport.clone();
    assert!(TestEnv::wait_until(|| transport.acked() == 1, WAIT).await);
    runner.stop().await.unwrap();

    assert_eq!(handler.units().len(), 1);
    assert_eq!(h.transport.pending_count("reclaim-work", "work"), 0);
    assert_eq!(h.transport.acked(), 1);
    let run = h.db.run(run.id).unwrap();
    assert_eq!((run.aggr_total, run.aggr_ok, run.aggr_err), (1, 1, 0));
}

#[tokio::test]
async fn test_resumes_after_connection_drop() {
    let h = Harness::new();
    let queue = h
        .db
        .insert_queue(QueueBuilder::new(1, "flaky").with_task("work", 1).build());
    let runner = h.runner("flaky-work", "work", Arc::new(FnHandler::echo()));
    runner.start().await.unwrap();

    h.transport.disconnect();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(runner.is_running());
    h.transport.reconnect();

    let run = h.seed_chain(&queue, vec![json!(1), json!(2)]).await;
    assert_eq!(h.wait_for_status(run.id).await, Code::Ok);
    runner.stop().await.unwrap();
}

struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

#[async_trait]
impl TaskHandler for ConcurrencyGauge {
    async fn handle(&self, _unit: &WorkUnit) -> QueuerResult<Value> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn test_pool_bounds_concurrency_and_stop_drains() {
    let h = Harness::new();
    let queue = h
        .db
        .insert_queue(QueueBuilder::new(1, "bulk").with_task("work", 1).build());
    let gauge = Arc::new(ConcurrencyGauge {
        current: AtomicUsize::new(0),
        max: AtomicUsize::new(0),
    });
    let runner = h
        .builder("bulk-work", "work", gauge.clone())
        .concurrency(3)
        .read_count(10)
        .build()
        .unwrap();
    runner.start().await.unwrap();

    let run = h.seed_chain(&queue, (0..12).map(|i| json!(i)).collect()).await;
    let db = h.db.clone();
    assert!(
        TestEnv::wait_until(|| db.run(run.id).is_some_and(|r| r.aggr_ok >= 4), WAIT).await
    );
    runner.stop().await.unwrap();

    assert_eq!(runner.in_flight(), 0);
    assert!(gauge.max.load(Ordering::SeqCst) <= 3);
    assert!(gauge.max.load(Ordering::SeqCst) >= 2);
    // 停止时已开始的任务全部完成并结算
    let started = h
        .db
        .task_runs(run.id)
        .into_iter()
        .filter(|tr| tr.started.is_some())
        .collect::<Vec<_>>();
    assert!(started.iter().all(|tr| tr.code != Code::Pending));
}

#[tokio::test]
async fn test_builder_rejects_incomplete_configuration() {
    let h = Harness::new();
    let db = Arc::new(h.db.clone());

    let missing_handler = TaskRunner::builder("work")
        .host("h")
        .runs(db.clone())
        .task_runs(db.clone())
        .transport(Arc::new(h.transport.clone()))
        .notifier(h.notifier.clone())
        .build();
    assert!(matches!(missing_handler, Err(QueuerError::Configuration(_))));

    let zero_concurrency = h
        .builder("s", "work", Arc::new(FnHandler::echo()))
        .concurrency(0)
        .build();
    assert!(matches!(zero_concurrency, Err(QueuerError::Configuration(_))));

    let bad_schema = h
        .builder("s", "work", Arc::new(FnHandler::echo()))
        .schemas(TaskSchemas {
            options: Some(json!({"type": "nonsense"})),
            payload: None,
        })
        .build();
    assert!(matches!(bad_schema, Err(QueuerError::Configuration(_))));

    let runner = h
        .builder(&task_stream_name("q", "work"), "work", Arc::new(FnHandler::echo()))
        .build()
        .unwrap();
    assert_eq!(runner.name(), "q-work");
    assert_eq!(runner.group(), "work");
}
