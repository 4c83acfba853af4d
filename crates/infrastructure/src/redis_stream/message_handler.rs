//! Stream 条目的编码与回复解析
//!
//! 条目只有一个 `data` 字段，值为 `StreamMessage` 的 JSON。

use queuer_core::{models::StreamMessage, QueuerResult};
use redis::Value;

/// 条目中承载消息体的字段名
pub const DATA_FIELD: &str = "data";

/// 解析后的原始条目
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub xid: String,
    /// 条目已被裁剪或删除时为 `None`
    pub data: Option<String>,
}

impl RawEntry {
    /// 反序列化消息体，失败时返回原因
    pub fn decode(&self) -> Result<StreamMessage, String> {
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| "条目内容缺失".to_string())?;
        serde_json::from_str(data).map_err(|e| format!("消息体解析失败: {e}"))
    }
}

pub fn encode(message: &StreamMessage) -> QueuerResult<String> {
    Ok(serde_json::to_string(message)?)
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Nil => None,
        other => redis::from_redis_value::<String>(other).ok(),
    }
}

fn as_items(value: &Value) -> Option<&[Value]> {
    match value {
        Value::Array(items) | Value::Set(items) => Some(items),
        _ => None,
    }
}

/// 在字段/值列表中查找 `data`
fn find_data(fields: &Value) -> Option<String> {
    match fields {
        Value::Map(pairs) => pairs
            .iter()
            .find(|(k, _)| as_string(k).as_deref() == Some(DATA_FIELD))
            .and_then(|(_, v)| as_string(v)),
        other => {
            let items = as_items(other)?;
            items
                .chunks(2)
                .find(|pair| pair.len() == 2 && as_string(&pair[0]).as_deref() == Some(DATA_FIELD))
                .and_then(|pair| as_string(&pair[1]))
        }
    }
}

/// 解析 `[[id, [field, value, ...]], ...]`
pub fn parse_entries(value: &Value) -> Vec<RawEntry> {
    let Some(items) = as_items(value) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|entry| {
            let parts = as_items(entry)?;
            let xid = as_string(parts.first()?)?;
            let data = parts.get(1).and_then(find_data);
            Some(RawEntry { xid, data })
        })
        .collect()
}

/// 解析 XREADGROUP 回复，只取指定 Stream 的条目
///
/// 超时返回 `Nil`；RESP2 为 `[[stream, entries], ...]`，RESP3 为映射。
pub fn parse_read_reply(value: &Value, stream: &str) -> Vec<RawEntry> {
    match value {
        Value::Nil => Vec::new(),
        Value::Map(pairs) => pairs
            .iter()
            .filter(|(k, _)| as_string(k).as_deref() == Some(stream))
            .flat_map(|(_, entries)| parse_entries(entries))
            .collect(),
        other => as_items(other)
            .unwrap_or_default()
            .iter()
            .filter_map(|s| {
                let parts = as_items(s)?;
                if as_string(parts.first()?)?.as_str() != stream {
                    return None;
                }
                Some(parse_entries(parts.get(1)?))
            })
            .flatten()
            .collect(),
    }
}

/// 解析 XAUTOCLAIM 回复 `[cursor, entries, deleted?]`
pub fn parse_autoclaim_reply(value: &Value) -> Vec<RawEntry> {
    as_items(value)
        .and_then(|parts| parts.get(1))
        .map(parse_entries)
        .unwrap_or_default()
}
