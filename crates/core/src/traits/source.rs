use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{models::SourceConnection, QueuerResult};

/// 数据源查询执行器
///
/// 逐行执行参数化查询，把每一行以 JSON 对象写入有界通道。
/// 通道满时等待消费者，绝不一次性缓冲全部结果。
/// 接收端被丢弃时停止读取并正常返回。
#[async_trait]
pub trait SourceExecutor: Send + Sync {
    /// 返回已发送的行数
    async fn stream_rows(
        &self,
        connection: &SourceConnection,
        query: &str,
        params: &Value,
        sink: mpsc::Sender<Value>,
    ) -> QueuerResult<u64>;
}

/// 查询中最大的 `$N` 占位符编号
pub fn placeholder_count(query: &str) -> usize {
    let bytes = query.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                if let Ok(n) = query[start..end].parse::<usize>() {
                    max = max.max(n);
                }
            }
            i = end.max(i + 1);
        } else {
            i += 1;
        }
    }
    max
}

/// 把触发负载转换为查询参数
///
/// 数组按位置绑定；其他非空值绑定为 `$1`；参数个数由查询中的占位符决定，
/// 不足的位置补 `null`。
pub fn bind_params(query: &str, payload: &Value) -> Vec<Value> {
    let count = placeholder_count(query);
    let mut params: Vec<Value> = match payload {
        Value::Array(values) => values.iter().take(count).cloned().collect(),
        Value::Null => Vec::new(),
        other if count > 0 => vec![other.clone()],
        _ => Vec::new(),
    };
    params.resize(count, Value::Null);
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholder_count() {
        assert_eq!(placeholder_count("SELECT 1"), 0);
        assert_eq!(placeholder_count("SELECT * FROM t WHERE a = $1 AND b = $2"), 2);
        assert_eq!(placeholder_count("SELECT $3, $1"), 3);
        assert_eq!(placeholder_count("SELECT '$' || $12"), 12);
    }

    #[test]
    fn test_bind_params() {
        let q = "SELECT * FROM t WHERE a = $1 AND b = $2";
        assert_eq!(bind_params(q, &json!([1, "x", 3])), vec![json!(1), json!("x")]);
        assert_eq!(bind_params(q, &json!(7)), vec![json!(7), Value::Null]);
        assert_eq!(bind_params("SELECT 1", &json!({"a": 1})), Vec::<Value>::new());
        assert_eq!(bind_params("SELECT $1", &Value::Null), vec![Value::Null]);
    }
}
