use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use queuer_core::{models::WorkUnit, traits::TaskHandler, QueuerError, QueuerResult};

/// 记录工作单元并原样返回负载
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    async fn handle(&self, unit: &WorkUnit) -> QueuerResult<Value> {
        info!(
            "处理任务: queue={}, task={}, run_id={}, task_run_id={:?}, payload={}",
            unit.queue_name, unit.task_name, unit.run_id, unit.task_run_id, unit.payload
        );
        Ok(unit.payload.clone())
    }
}

/// 把负载发送到 `options.url` 的 HTTP 处理器
///
/// 支持的选项：
/// - `url`: 必填
/// - `method`: 默认 `POST`
/// - `timeout_seconds`: 默认 30
///
/// 响应体能解析为 JSON 时作为结果返回，否则以字符串返回。
pub struct HttpHandler {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            default_timeout: Duration::from_secs(30),
        }
    }

    fn request(&self, unit: &WorkUnit) -> QueuerResult<reqwest::RequestBuilder> {
        let url = unit
            .options
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| QueuerError::task_execution("HTTP处理器缺少选项 url"))?;
        let method = unit
            .options
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_uppercase();
        let timeout = unit
            .options
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let builder = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url).json(&unit.payload),
            "PUT" => self.client.put(url).json(&unit.payload),
            "PATCH" => self.client.patch(url).json(&unit.payload),
            "DELETE" => self.client.delete(url),
            _ => {
                return Err(QueuerError::task_execution(format!(
                    "不支持的HTTP方法: {method}"
                )))
            }
        };
        Ok(builder.timeout(timeout))
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for HttpHandler {
    async fn handle(&self, unit: &WorkUnit) -> QueuerResult<Value> {
        let response = self
            .request(unit)?
            .send()
            .await
            .map_err(|e| QueuerError::task_execution(format!("HTTP请求失败: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QueuerError::task_execution(format!("读取响应体失败: {e}")))?;
        debug!("HTTP任务返回状态 {}: task={}", status, unit.task_name);

        if !status.is_success() {
            return Err(QueuerError::task_execution(format!(
                "HTTP请求失败，状态码: {}",
                status.as_u16()
            )));
        }

        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

/// 处理器注册表
///
/// 由嵌入应用显式构建并传给 Worker，按配置中的处理器名称查找。
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 包含内置 `log` 与 `http` 处理器的注册表
    pub fn with_builtin() -> Self {
        Self::new()
            .register("log", Arc::new(LogHandler))
            .register("http", Arc::new(HttpHandler::new()))
    }

    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> QueuerResult<Arc<dyn TaskHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| QueuerError::configuration(format!("未注册的处理器: {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
