//! # Queuer Testing Utils
//!
//! 队列编排系统各 crate 共用的测试工具：
//!
//! - **MockDatabase**: 实现全部仓储接口的内存数据库，所有操作在同一把锁内完成，
//!   与单条 SQL 语句的原子性一致
//! - **InMemoryStreamTransport**: 带消费者组、待确认列表、阻塞读取和连接断开模拟的内存 Stream
//! - **InMemoryTriggerChannel**: 记录已发布消息的内存触发通道
//! - **MockSourceExecutor**: 返回预设行的数据源执行器
//! - **Builders**: 队列与任务测试数据构建器
//! - **Containers**: PostgreSQL/Redis 测试容器
//!
//! ```toml
//! [dev-dependencies]
//! queuer-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod containers;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use containers::*;
pub use helpers::*;
pub use mocks::*;
