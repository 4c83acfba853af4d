use thiserror::Error;

/// 队列编排系统错误类型定义
#[derive(Debug, Error)]
pub enum QueuerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("队列未找到: {0}")]
    QueueNotFound(String),

    #[error("运行实例未找到: {id}")]
    RunNotFound { id: i64 },

    #[error("任务运行实例未找到: {id}")]
    TaskRunNotFound { id: i64 },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    /// 传输层连接已断开，需要等待连接恢复后重试
    #[error("消息队列连接已断开: {0}")]
    ConnectionClosed(String),

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("触发通道错误: {0}")]
    Trigger(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("校验失败: {0}")]
    Validation(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl QueuerError {
    /// 是否为传输层连接断开
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, QueuerError::ConnectionClosed(_))
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        QueuerError::Configuration(message.into())
    }

    pub fn task_execution(message: impl Into<String>) -> Self {
        QueuerError::TaskExecution(message.into())
    }
}

impl From<serde_json::Error> for QueuerError {
    fn from(e: serde_json::Error) -> Self {
        QueuerError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, QueuerError>;
