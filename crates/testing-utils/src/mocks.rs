//! 仓储、传输与触发通道的内存实现
//!
//! 不需要数据库或 Redis 即可对调度器和 Worker 进行测试。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuer_core::models::{
    Code, Delivery, Item, Queue, Run, SourceConnection, StreamMessage, TaskOutcome, TaskRun,
    TaskRunTemplate, TaskRunUnit, TriggerMessage, WorkUnit,
};
use queuer_core::traits::{
    QueueRepository, ReadRequest, RunRepository, SourceExecutor, StreamTransport, TaskHandler,
    TaskRunRepository, TriggerChannel,
};
use queuer_core::{QueuerError, QueuerResult};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};


/// 任务运行实例的状态变化记录，按发生顺序排列
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRunEvent {
    Started {
        task_run_id: i64,
        item_id: i64,
        order: i32,
    },
    Settled {
        task_run_id: i64,
        item_id: i64,
        order: i32,
        code: Code,
    },
}

#[derive(Default)]
struct Tables {
    queues: BTreeMap<i64, Queue>,
    connections: HashMap<i64, SourceConnection>,
    runs: BTreeMap<i64, Run>,
    items: BTreeMap<i64, Item>,
    task_runs: BTreeMap<i64, TaskRun>,
    /// 已记账的无任务链条目 `(run_id, entry)`
    entries: HashSet<(i64, String)>,
    events: Vec<TaskRunEvent>,
    failing_queues: HashSet<i64>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn siblings(&self, item_id: i64) -> Vec<&TaskRun> {
        let mut siblings: Vec<&TaskRun> = self
            .task_runs
            .values()
            .filter(|tr| tr.item_id == item_id)
            .collect();
        siblings.sort_by_key(|tr| (tr.order, tr.id));
        siblings
    }

    fn item_with_task_runs(&self, item: &Item) -> Item {
        let mut item = item.clone();
        item.task_runs = self.siblings(item.id).into_iter().cloned().collect();
        item
    }

    /// 单条语句语义：计数自增并重新推导状态
    ///
    /// 与数据库约束一致，`aggr_ok + aggr_err` 超过 `aggr_total` 时报错且不做修改。
    fn credit_run(
        &mut self,
        run_id: i64,
        task_id: Option<i64>,
        success: bool,
    ) -> QueuerResult<Option<Run>> {
        let Some(run) = self.runs.get_mut(&run_id) else {
            return Ok(None);
        };
        if run.status != Code::Pending {
            return Ok(None);
        }
        if run.aggr_ok + run.aggr_err + 1 > run.aggr_total {
            return Err(QueuerError::DatabaseOperation(format!(
                "运行实例 {run_id} 违反约束 runs_aggr_bounded"
            )));
        }
        if success {
            run.aggr_ok += 1;
        } else {
            run.aggr_err += 1;
        }
        if task_id.is_some() {
            run.task_id = task_id;
        }
        run.status = run.derive_status();
        run.updated_at = Utc::now();
        Ok(Some(run.clone()))
    }
}

/// 内存数据库
///
/// 同时实现 `QueueRepository`、`RunRepository` 与 `TaskRunRepository`。
/// 每个方法在同一把锁内完成，对应数据库中的单条原子语句或单个事务。
#[derive(Clone, Default)]
pub struct MockDatabase {
    tables: Arc<Mutex<Tables>>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_queue(&self, queue: Queue) -> Queue {
        let mut tables = self.tables.lock().unwrap();
        tables.next_id = tables.next_id.max(queue.id);
        tables.queues.insert(queue.id, queue.clone());
        queue
    }

    pub fn insert_connection(&self, connection: SourceConnection) {
        let mut tables = self.tables.lock().unwrap();
        tables.connections.insert(connection.id, connection);
    }

    /// 之后为该队列创建运行实例时返回错误
    pub fn fail_runs_for_queue(&self, queue_id: i64) {
        self.tables.lock().unwrap().failing_queues.insert(queue_id);
    }

    pub fn queue(&self, id: i64) -> Option<Queue> {
        self.tables.lock().unwrap().queues.get(&id).cloned()
    }

    pub fn run(&self, id: i64) -> Option<Run> {
        self.tables.lock().unwrap().runs.get(&id).cloned()
    }

    pub fn runs(&self) -> Vec<Run> {
        self.tables.lock().unwrap().runs.values().cloned().collect()
    }

    pub fn runs_for_queue(&self, queue_id: i64) -> Vec<Run> {
        self.runs()
            .into_iter()
            .filter(|r| r.queue_id == queue_id)
            .collect()
    }

    /// 运行实例下的条目（含任务运行实例）
    pub fn items(&self, run_id: i64) -> Vec<Item> {
        let tables = self.tables.lock().unwrap();
        tables
            .items
            .values()
            .filter(|i| i.run_id == run_id)
            .map(|i| tables.item_with_task_runs(i))
            .collect()
    }

    pub fn task_run(&self, id: i64) -> Option<TaskRun> {
        self.tables.lock().unwrap().task_runs.get(&id).cloned()
    }

    pub fn task_runs(&self, run_id: i64) -> Vec<TaskRun> {
        self.tables
            .lock()
            .unwrap()
            .task_runs
            .values()
            .filter(|tr| tr.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn events(&self) -> Vec<TaskRunEvent> {
        self.tables.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl QueueRepository for MockDatabase {
    async fn get_by_id(&self, id: i64) -> QueuerResult<Option<Queue>> {
        Ok(self.queue(id))
    }

    async fn get_by_name(&self, name: &str) -> QueuerResult<Vec<Queue>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .queues
            .values()
            .filter(|q| q.name == name)
            .cloned()
            .collect())
    }

    async fn get_due_scheduled(
        &self,
        now: DateTime<Utc>,
        name_filter: Option<&str>,
    ) -> QueuerResult<Vec<Queue>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .queues
            .values()
            .filter(|q| q.schedule.as_ref().is_some_and(|s| s.is_due(now)))
            .filter(|q| q.matches_filter(name_filter))
            .cloned()
            .collect())
    }

    async fn advance_schedule(
        &self,
        queue_id: i64,
        expected: Option<DateTime<Utc>>,
        next: DateTime<Utc>,
    ) -> QueuerResult<bool> {
        let mut tables = self.tables.lock().unwrap();
        let schedule = tables
            .queues
            .get_mut(&queue_id)
            .and_then(|q| q.schedule.as_mut());
        match schedule {
            Some(schedule) if schedule.next == expected => {
                schedule.next = Some(next);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_dependents(&self, queue_id: i64) -> QueuerResult<Vec<Queue>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .queues
            .values()
            .filter(|q| q.previous_queue_id == Some(queue_id))
            .cloned()
            .collect())
    }

    async fn get_connection(&self, id: i64) -> QueuerResult<Option<SourceConnection>> {
        Ok(self.tables.lock().unwrap().connections.get(&id).cloned())
    }
}

#[async_trait]
impl RunRepository for MockDatabase {
    async fn create(&self, queue: &Queue, payload: &Value) -> QueuerResult<Run> {
        let mut tables = self.tables.lock().unwrap();
        if tables.failing_queues.contains(&queue.id) {
            return Err(QueuerError::DatabaseOperation(format!(
                "无法为队列 {} 创建运行实例",
                queue.name
            )));
        }
        let now = Utc::now();
        let run = Run {
            id: tables.next_id(),
            queue_id: queue.id,
            name: queue.name.clone(),
            aggr_total: 0,
            aggr_ok: 0,
            aggr_err: 0,
            status: Code::Pending,
            task_id: None,
            sealed: false,
            completion_claimed: false,
            payload: payload.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_by_id(&self, id: i64) -> QueuerResult<Option<Run>> {
        Ok(self.run(id))
    }

    async fn increment_total(&self, run_id: i64, by: i64) -> QueuerResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or(QueuerError::RunNotFound { id: run_id })?;
        run.aggr_total += by;
        Ok(())
    }

    async fn finalize_total(&self, run_id: i64, total: i64) -> QueuerResult<Run> {
        let mut tables = self.tables.lock().unwrap();
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or(QueuerError::RunNotFound { id: run_id })?;
        run.aggr_total = total;
        run.sealed = true;
        if run.status == Code::Pending {
            run.status = run.derive_status();
        }
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn record_outcome(
        &self,
        run_id: i64,
        entry: &str,
        success: bool,
    ) -> QueuerResult<Option<Run>> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.runs.contains_key(&run_id) {
            return Err(QueuerError::RunNotFound { id: run_id });
        }
        let key = (run_id, entry.to_string());
        if tables.entries.contains(&key) {
            return Ok(None);
        }
        let credited = tables.credit_run(run_id, None, success)?;
        if credited.is_some() {
            tables.entries.insert(key);
        }
        Ok(credited)
    }

    async fn entry_recorded(&self, run_id: i64, entry: &str) -> QueuerResult<bool> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.entries.contains(&(run_id, entry.to_string())))
    }

    async fn claim_completion(&self, run_id: i64, task_id: Option<i64>) -> QueuerResult<bool> {
        let mut tables = self.tables.lock().unwrap();
        let Some(run) = tables.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        let claimable = run.status != Code::Pending
            && !run.completion_claimed
            && task_id.map_or(true, |id| run.task_id == Some(id));
        if claimable {
            run.completion_claimed = true;
        }
        Ok(claimable)
    }
}

#[async_trait]
impl TaskRunRepository for MockDatabase {
    async fn create_item(
        &self,
        run_id: i64,
        payload: &Value,
        templates: &[TaskRunTemplate],
    ) -> QueuerResult<Item> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.runs.contains_key(&run_id) {
            return Err(QueuerError::RunNotFound { id: run_id });
        }
        let item = Item {
            id: tables.next_id(),
            run_id,
            payload: payload.clone(),
            code: Code::Pending,
            task_runs: Vec::new(),
        };
        tables.items.insert(item.id, item.clone());
        for template in templates {
            let task_run = TaskRun {
                id: tables.next_id(),
                item_id: item.id,
                run_id,
                task_id: template.task_id,
                name: template.name.clone(),
                order: template.order,
                code: Code::Pending,
                started: None,
                xid: None,
                reason: None,
                result: None,
                options: template.options.clone(),
                host: None,
            };
            tables.task_runs.insert(task_run.id, task_run);
        }
        Ok(tables.item_with_task_runs(&item))
    }

    async fn get_unit(&self, task_run_id: i64) -> QueuerResult<Option<TaskRunUnit>> {
        let tables = self.tables.lock().unwrap();
        let Some(task_run) = tables.task_runs.get(&task_run_id).cloned() else {
            return Ok(None);
        };
        let item = tables
            .items
            .get(&task_run.item_id)
            .ok_or_else(|| QueuerError::DatabaseOperation(format!("条目 {} 不存在", task_run.item_id)))?;
        let run = tables
            .runs
            .get(&task_run.run_id)
            .cloned()
            .ok_or(QueuerError::RunNotFound { id: task_run.run_id })?;
        let siblings = tables.siblings(task_run.item_id);
        let previous_result = siblings
            .iter()
            .filter(|tr| (tr.order, tr.id) < (task_run.order, task_run.id))
            .last()
            .and_then(|tr| tr.result.clone());
        let next = siblings
            .iter()
            .find(|tr| (tr.order, tr.id) > (task_run.order, task_run.id))
            .map(|tr| (*tr).clone());
        Ok(Some(TaskRunUnit {
            payload: item.payload.clone(),
            task_run,
            run,
            previous_result,
            next,
        }))
    }

    async fn mark_started(
        &self,
        task_run_id: i64,
        xid: &str,
        host: &str,
    ) -> QueuerResult<Option<TaskRun>> {
        let mut tables = self.tables.lock().unwrap();
        let Some(task_run) = tables.task_runs.get_mut(&task_run_id) else {
            return Ok(None);
        };
        if !task_run.can_start(xid) {
            return Ok(None);
        }
        task_run.started = Some(Utc::now());
        task_run.xid = Some(xid.to_string());
        task_run.host = Some(host.to_string());
        let task_run = task_run.clone();
        tables.events.push(TaskRunEvent::Started {
            task_run_id,
            item_id: task_run.item_id,
            order: task_run.order,
        });
        Ok(Some(task_run))
    }

    async fn settle(&self, task_run_id: i64, outcome: &TaskOutcome) -> QueuerResult<Option<Run>> {
        if outcome.code == Code::Pending {
            return Err(QueuerError::Validation("结算结果不能为 pending".to_string()));
        }
        let mut tables = self.tables.lock().unwrap();
        let task_run = tables
            .task_runs
            .get(&task_run_id)
            .cloned()
            .ok_or(QueuerError::TaskRunNotFound { id: task_run_id })?;
        if task_run.code != Code::Pending {
            return Ok(None);
        }

        let is_last = !tables
            .siblings(task_run.item_id)
            .iter()
            .any(|tr| (tr.order, tr.id) > (task_run.order, task_run.id));
        let ends_item = !outcome.is_ok() || is_last;

        // 先更新运行实例，出错时整个结算不生效
        let credited = if ends_item {
            tables.credit_run(task_run.run_id, Some(task_run.task_id), outcome.is_ok())?
        } else {
            None
        };

        if let Some(stored) = tables.task_runs.get_mut(&task_run_id) {
            stored.code = outcome.code;
            stored.reason = outcome.reason.clone();
            stored.result = outcome.result.clone();
        }
        tables.events.push(TaskRunEvent::Settled {
            task_run_id,
            item_id: task_run.item_id,
            order: task_run.order,
            code: outcome.code,
        });
        if ends_item {
            if let Some(item) = tables.items.get_mut(&task_run.item_id) {
                item.code = outcome.code;
            }
        }

        Ok(credited.or_else(|| tables.runs.get(&task_run.run_id).cloned()))
    }
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<u64, StreamMessage>,
    groups: HashMap<String, GroupState>,
    seq: u64,
}

#[derive(Default)]
struct TransportState {
    streams: HashMap<String, StreamState>,
    failing_streams: HashSet<String>,
    ack_failures: usize,
    acked: usize,
}

fn parse_xid(xid: &str) -> Option<u64> {
    xid.split('-').next().and_then(|s| s.parse().ok())
}

fn delivery(stream: &str, seq: u64, message: &StreamMessage) -> Delivery {
    Delivery {
        xid: format!("{seq}-0"),
        stream: stream.to_string(),
        message: message.clone(),
    }
}

/// 内存 Stream 传输
///
/// 行为与 Redis Stream 消费者组一致：新条目只投递给一个消费者，
/// 投递后进入待确认列表，直到确认；可按空闲时长转移给其他消费者。
#[derive(Clone)]
pub struct InMemoryStreamTransport {
    state: Arc<Mutex<TransportState>>,
    notify: Arc<Notify>,
    connected: Arc<watch::Sender<bool>>,
    max_len: usize,
}

impl Default for InMemoryStreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStreamTransport {
    pub fn new() -> Self {
        Self::with_max_len(10_000)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(TransportState::default())),
            notify: Arc::new(Notify::new()),
            connected: Arc::new(connected),
            max_len,
        }
    }

    /// 模拟连接断开
    pub fn disconnect(&self) {
        self.connected.send_replace(false);
        self.notify.notify_waiters();
    }

    pub fn reconnect(&self) {
        self.connected.send_replace(true);
        self.notify.notify_waiters();
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// 之后向该 Stream 写入时返回错误
    pub fn fail_pushes(&self, stream: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_streams
            .insert(stream.to_string());
    }

    /// 接下来的 n 次确认返回错误，条目保留在待确认列表中
    pub fn fail_next_acks(&self, n: usize) {
        self.state.lock().unwrap().ack_failures = n;
    }

    /// Stream 中现存的条目
    pub fn entries(&self, stream: &str) -> Vec<Delivery> {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(seq, msg)| delivery(stream, *seq, msg))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// 已成功确认的条目总数
    pub fn acked(&self) -> usize {
        self.state.lock().unwrap().acked
    }

    fn ensure_connected(&self) -> QueuerResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(QueuerError::ConnectionClosed("连接已断开".to_string()))
        }
    }

    fn try_read(&self, request: &ReadRequest) -> QueuerResult<Vec<Delivery>> {
        let mut state = self.state.lock().unwrap();
        let stream = state
            .streams
            .get_mut(&request.stream)
            .ok_or_else(|| QueuerError::MessageQueue(format!("Stream不存在: {}", request.stream)))?;
        let StreamState { entries, groups, .. } = stream;
        let group = groups
            .get_mut(&request.group)
            .ok_or_else(|| QueuerError::MessageQueue(format!("消费者组不存在: {}", request.group)))?;

        let mut deliveries = Vec::new();
        if request.pending {
            for (seq, pending) in group.pending.iter_mut() {
                if deliveries.len() >= request.count {
                    break;
                }
                if pending.consumer != request.consumer {
                    continue;
                }
                if let Some(message) = entries.get(seq) {
                    pending.deliveries += 1;
                    pending.delivered_at = Instant::now();
                    deliveries.push(delivery(&request.stream, *seq, message));
                }
            }
            return Ok(deliveries);
        }

        let start = group.last_delivered;
        for (seq, message) in entries.range(start + 1..).take(request.count) {
            group.last_delivered = *seq;
            group.pending.insert(
                *seq,
                PendingEntry {
                    consumer: request.consumer.clone(),
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
            deliveries.push(delivery(&request.stream, *seq, message));
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl StreamTransport for InMemoryStreamTransport {
    async fn ensure_group(&self, stream: &str, group: &str) -> QueuerResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock().unwrap();
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn push(&self, stream: &str, message: &StreamMessage) -> QueuerResult<String> {
        self.ensure_connected()?;
        let xid = {
            let mut state = self.state.lock().unwrap();
            if state.failing_streams.contains(stream) {
                return Err(QueuerError::MessageQueue(format!("写入Stream失败: {stream}")));
            }
            let s = state.streams.entry(stream.to_string()).or_default();
            s.seq += 1;
            let seq = s.seq;
            s.entries.insert(seq, message.clone());
            while s.entries.len() > self.max_len {
                s.entries.pop_first();
            }
            format!("{seq}-0")
        };
        self.notify.notify_waiters();
        Ok(xid)
    }

    async fn read_group(&self, request: &ReadRequest) -> QueuerResult<Vec<Delivery>> {
        let deadline = Instant::now() + request.block;
        loop {
            self.ensure_connected()?;
            let deliveries = self.try_read(request)?;
            if !deliveries.is_empty() || request.pending {
                return Ok(deliveries);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = (deadline - now).min(Duration::from_millis(10));
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueuerResult<Vec<Delivery>> {
        self.ensure_connected()?;
        let mut state = self.state.lock().unwrap();
        let Some(s) = state.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let StreamState { entries, groups, .. } = s;
        let Some(g) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let mut deliveries = Vec::new();
        for (seq, pending) in g.pending.iter_mut() {
            if deliveries.len() >= count {
                break;
            }
            if pending.delivered_at.elapsed() < min_idle {
                continue;
            }
            if let Some(message) = entries.get(seq) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = Instant::now();
                pending.deliveries += 1;
                deliveries.push(delivery(stream, *seq, message));
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, stream: &str, group: &str, xid: &str) -> QueuerResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock().unwrap();
        if state.ack_failures > 0 {
            state.ack_failures -= 1;
            return Err(QueuerError::MessageQueue(format!("确认条目失败: {xid}")));
        }
        let seq = parse_xid(xid)
            .ok_or_else(|| QueuerError::MessageQueue(format!("无效的条目ID: {xid}")))?;
        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&seq))
            .is_some();
        if removed {
            state.acked += 1;
        }
        Ok(())
    }

    async fn wait_until_connected(&self) -> QueuerResult<()> {
        let mut rx = self.connected.subscribe();
        rx.wait_for(|connected| *connected)
            .await
            .map_err(|e| QueuerError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn health_check(&self) -> QueuerResult<()> {
        self.ensure_connected()
    }
}

/// 内存触发通道
#[derive(Clone, Default)]
pub struct InMemoryTriggerChannel {
    published: Arc<Mutex<Vec<TriggerMessage>>>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<TriggerMessage>>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryTriggerChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<TriggerMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[async_trait]
impl TriggerChannel for InMemoryTriggerChannel {
    async fn publish(&self, message: &TriggerMessage) -> QueuerResult<()> {
        if *self.failing.lock().unwrap() {
            return Err(QueuerError::Trigger("发布失败".to_string()));
        }
        self.published.lock().unwrap().push(message.clone());
        let subscribers = self.subscribers.lock().unwrap().clone();
        for subscriber in subscribers {
            let _ = subscriber.send(message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self) -> QueuerResult<mpsc::Receiver<TriggerMessage>> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self) -> QueuerResult<()> {
        self.subscribers.lock().unwrap().clear();
        Ok(())
    }
}

/// 预设结果的数据源执行器
#[derive(Clone, Default)]
pub struct MockSourceExecutor {
    rows: Arc<Mutex<Vec<Value>>>,
    fail_after: Arc<Mutex<Option<usize>>>,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockSourceExecutor {
    pub fn with_rows(rows: Vec<Value>) -> Self {
        let executor = Self::default();
        *executor.rows.lock().unwrap() = rows;
        executor
    }

    /// 发送 n 行之后返回查询错误
    pub fn fail_after(self, n: usize) -> Self {
        *self.fail_after.lock().unwrap() = Some(n);
        self
    }

    /// 调用记录：(查询, 参数)
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceExecutor for MockSourceExecutor {
    async fn stream_rows(
        &self,
        _connection: &SourceConnection,
        query: &str,
        params: &Value,
        sink: mpsc::Sender<Value>,
    ) -> QueuerResult<u64> {
        self.calls
            .lock()
            .unwrap()
            .push((query.to_string(), params.clone()));
        let rows = self.rows.lock().unwrap().clone();
        let fail_after = *self.fail_after.lock().unwrap();
        let mut sent = 0u64;
        for (i, row) in rows.into_iter().enumerate() {
            if fail_after == Some(i) {
                return Err(QueuerError::DatabaseOperation("数据源查询失败".to_string()));
            }
            if sink.send(row).await.is_err() {
                break;
            }
            sent += 1;
        }
        if fail_after == Some(sent as usize) {
            return Err(QueuerError::DatabaseOperation("数据源查询失败".to_string()));
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::QueueBuilder;
    use queuer_core::models::TaskRunTemplate;
    use serde_json::json;

    #[tokio::test]
    async fn test_settle_is_guarded() {
        let db = MockDatabase::new();
        let queue = db.insert_queue(QueueBuilder::new(1, "q").with_task("a", 1).build());
        let run = RunRepository::create(&db, &queue, &Value::Null).await.unwrap();
        let templates: Vec<TaskRunTemplate> = queue.tasks.iter().map(TaskRunTemplate::from).collect();
        let item = db.create_item(run.id, &json!({}), &templates).await.unwrap();
        db.increment_total(run.id, 1).await.unwrap();
        db.finalize_total(run.id, 1).await.unwrap();

        let tr = item.first_task_run().unwrap().id;
        let first = db.settle(tr, &TaskOutcome::ok(json!(1))).await.unwrap().unwrap();
        assert_eq!(first.status, Code::Ok);
        assert!(db.settle(tr, &TaskOutcome::ok(json!(1))).await.unwrap().is_none());
        assert_eq!(db.run(run.id).unwrap().aggr_ok, 1);
    }

    #[tokio::test]
    async fn test_transport_consumer_group() {
        let transport = InMemoryStreamTransport::new();
        transport.ensure_group("s", "g").await.unwrap();
        transport.push("s", &StreamMessage::task_run(1)).await.unwrap();
        transport.push("s", &StreamMessage::task_run(2)).await.unwrap();

        let request = |consumer: &str, pending: bool| ReadRequest {
            stream: "s".to_string(),
            group: "g".to_string(),
            consumer: consumer.to_string(),
            count: 1,
            block: Duration::from_millis(20),
            pending,
        };

        let a = transport.read_group(&request("a", false)).await.unwrap();
        let b = transport.read_group(&request("b", false)).await.unwrap();
        assert_eq!(a[0].message, StreamMessage::task_run(1));
        assert_eq!(b[0].message, StreamMessage::task_run(2));
        assert!(transport.read_group(&request("a", false)).await.unwrap().is_empty());

        let again = transport.read_group(&request("a", true)).await.unwrap();
        assert_eq!(again[0].xid, a[0].xid);

        transport.ack("s", "g", &a[0].xid).await.unwrap();
        assert_eq!(transport.pending_count("s", "g"), 1);
        assert!(transport.read_group(&request("a", true)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transport_disconnect() {
        let transport = InMemoryStreamTransport::new();
        transport.disconnect();
        let err = transport.push("s", &StreamMessage::task_run(1)).await.unwrap_err();
        assert!(err.is_connection_closed());

        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.wait_until_connected().await })
        };
        transport.reconnect();
        waiter.await.unwrap().unwrap();
    }
}

type HandlerFn = dyn Fn(&WorkUnit) -> QueuerResult<Value> + Send + Sync;

/// 由闭包实现的任务处理器，记录收到的工作单元
#[derive(Clone)]
pub struct FnHandler {
    f: Arc<HandlerFn>,
    delay: Option<Duration>,
    units: Arc<Mutex<Vec<WorkUnit>>>,
}

impl FnHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&WorkUnit) -> QueuerResult<Value> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            delay: None,
            units: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 原样返回负载
    pub fn echo() -> Self {
        Self::new(|unit| Ok(unit.payload.clone()))
    }

    /// 每次处理前等待指定时长
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn units(&self) -> Vec<WorkUnit> {
        self.units.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn handle(&self, unit: &WorkUnit) -> QueuerResult<Value> {
        self.units.lock().unwrap().push(unit.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.f)(unit)
    }
}
