//! Redis Stream 传输模块
//!
//! 每个任务对应一个 Stream，消费者组名为任务名。

pub mod connection_manager;
pub mod message_handler;
pub mod metrics_collector;
pub mod stream_operations;

pub use connection_manager::{map_redis_error, RedisConnectionManager};
pub use metrics_collector::{MetricsSnapshot, RedisStreamMetrics};
pub use stream_operations::RedisStreamTransport;
