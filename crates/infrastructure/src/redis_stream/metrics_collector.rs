use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::{counter, histogram};

/// Redis Stream传输指标
///
/// 计数器同时写入全局 `metrics` 注册表和本地原子计数。
#[derive(Debug, Clone, Default)]
pub struct RedisStreamMetrics {
    pub messages_pushed: Arc<AtomicU64>,
    pub messages_delivered: Arc<AtomicU64>,
    pub messages_acked: Arc<AtomicU64>,
    pub messages_malformed: Arc<AtomicU64>,
    pub messages_reclaimed: Arc<AtomicU64>,
    pub connection_errors: Arc<AtomicU64>,
}

impl RedisStreamMetrics {
    pub fn record_pushed(&self, stream: &str) {
        self.messages_pushed.fetch_add(1, Ordering::Relaxed);
        counter!("queuer_stream_messages_pushed_total", "stream" => stream.to_string())
            .increment(1);
    }

    pub fn record_delivered(&self, stream: &str, count: usize) {
        self.messages_delivered
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!("queuer_stream_messages_delivered_total", "stream" => stream.to_string())
            .increment(count as u64);
    }

    pub fn record_acked(&self) {
        self.messages_acked.fetch_add(1, Ordering::Relaxed);
        counter!("queuer_stream_messages_acked_total").increment(1);
    }

    /// 无法解析而被直接确认的条目
    pub fn record_malformed(&self) {
        self.messages_malformed.fetch_add(1, Ordering::Relaxed);
        counter!("queuer_stream_messages_malformed_total").increment(1);
    }

    pub fn record_reclaimed(&self, count: usize) {
        self.messages_reclaimed
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!("queuer_stream_messages_reclaimed_total").increment(count as u64);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        counter!("queuer_stream_connection_errors_total").increment(1);
    }

    /// 记录操作耗时
    pub fn record_operation_duration(&self, operation: &'static str, duration_ms: f64) {
        histogram!("queuer_stream_operation_duration_ms", "operation" => operation)
            .record(duration_ms);
    }

    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_pushed: self.messages_pushed.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            messages_malformed: self.messages_malformed.load(Ordering::Relaxed),
            messages_reclaimed: self.messages_reclaimed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_pushed: u64,
    pub messages_delivered: u64,
    pub messages_acked: u64,
    pub messages_malformed: u64,
    pub messages_reclaimed: u64,
    pub connection_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = RedisStreamMetrics::default();
        metrics.record_pushed("q-a");
        metrics.record_delivered("q-a", 3);
        metrics.record_acked();
        metrics.record_malformed();

        let stats = metrics.get_stats();
        assert_eq!(stats.messages_pushed, 1);
        assert_eq!(stats.messages_delivered, 3);
        assert_eq!(stats.messages_acked, 1);
        assert_eq!(stats.messages_malformed, 1);
        assert_eq!(stats.connection_errors, 0);
    }
}
