//! 基础设施层：PostgreSQL 仓储、数据源执行器、Redis Stream 传输与触发通道

pub mod database;
pub mod redis_stream;
pub mod trigger_channel;

pub use database::*;
pub use redis_stream::{RedisConnectionManager, RedisStreamMetrics, RedisStreamTransport};
pub use trigger_channel::RedisTriggerChannel;
