use serde::{Deserialize, Serialize};

/// Redis配置
///
/// 同时用于 Stream 传输和 Pub/Sub 触发通道。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    pub connection_timeout_seconds: u64,
    /// 写入 Stream 时的近似长度上限（`MAXLEN ~`）
    pub max_stream_length: usize,
    /// 连接断开后重连检查间隔
    pub reconnect_interval_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            connection_timeout_seconds: 5,
            max_stream_length: 10000,
            reconnect_interval_ms: 1000,
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("Redis主机地址不能为空"));
        }

        if self.port == 0 {
            return Err(anyhow::anyhow!("Redis端口必须大于0"));
        }

        if self.database < 0 {
            return Err(anyhow::anyhow!("Redis数据库索引不能为负数"));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Redis连接超时时间必须大于0"));
        }

        if self.max_stream_length == 0 {
            return Err(anyhow::anyhow!("Stream长度上限必须大于0"));
        }

        if self.reconnect_interval_ms == 0 {
            return Err(anyhow::anyhow!("重连检查间隔必须大于0"));
        }

        Ok(())
    }

    /// 构建Redis连接URL
    pub fn build_url(&self) -> String {
        let auth = if let Some(password) = &self.password {
            format!(":{password}@")
        } else {
            String::new()
        };
        format!(
            "redis://{}{}:{}/{}",
            auth, self.host, self.port, self.database
        )
    }
}
