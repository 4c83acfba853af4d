use async_trait::async_trait;
use serde_json::Value;

use crate::{models::WorkUnit, QueuerResult};

/// 任务处理器
///
/// 由嵌入应用提供，是 Worker 唯一必需的扩展点。
/// 返回值作为结果持久化；返回错误时以错误信息作为失败原因。
///
/// ```rust
/// use async_trait::async_trait;
/// use queuer_core::{models::WorkUnit, traits::TaskHandler, QueuerResult};
/// use serde_json::{json, Value};
///
/// struct Echo;
///
/// #[async_trait]
/// impl TaskHandler for Echo {
///     async fn handle(&self, unit: &WorkUnit) -> QueuerResult<Value> {
///         Ok(json!({ "echo": unit.payload }))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, unit: &WorkUnit) -> QueuerResult<Value>;
}
