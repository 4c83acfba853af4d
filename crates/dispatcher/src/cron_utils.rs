use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

use queuer_core::{QueuerError, QueuerResult};

/// 将标准 5 字段表达式补全为带秒的 6 字段形式
///
/// `cron` crate 只解析以秒开头的表达式，6/7 字段的表达式原样返回。
pub fn normalize_expression(cron_expr: &str) -> String {
    let trimmed = cron_expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// CRON表达式解析和调度工具
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> QueuerResult<Self> {
        let normalized = normalize_expression(cron_expr);
        let schedule = Schedule::from_str(&normalized).map_err(|e| QueuerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression: cron_expr.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 获取严格晚于 `from` 的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    /// 计算下次执行时间距离现在的时长
    pub fn time_until_next_execution(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_execution_time(now).map(|next| next - now)
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> QueuerResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_normalize_expression() {
        assert_eq!(normalize_expression("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_expression(" 0 12 * * 1 "), "0 0 12 * * 1");
        assert_eq!(normalize_expression("*/5 * * * * *"), "*/5 * * * * *");
    }

    #[test]
    fn test_every_minute() {
        let scheduler = CronScheduler::new("* * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 15).unwrap();
        let next = scheduler.next_execution_time(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 10, 31, 0).unwrap());

        let times = scheduler.upcoming_times(from, 3);
        assert_eq!(times.len(), 3);
        assert!(times.iter().all(|t| t.second() == 0));
    }

    #[test]
    fn test_next_is_strictly_later() {
        let scheduler = CronScheduler::new("0 * * * *").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let next = scheduler.next_execution_time(on_the_hour).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap());
        assert_eq!(
            scheduler.time_until_next_execution(on_the_hour),
            Some(Duration::hours(1))
        );
    }

    #[test]
    fn test_invalid_expression() {
        let err = CronScheduler::new("not a cron").unwrap_err();
        assert!(matches!(err, QueuerError::InvalidCron { .. }));
        assert!(CronScheduler::validate_cron_expression("61 * * * *").is_err());
    }
}
