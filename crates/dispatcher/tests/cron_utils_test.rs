#[cfg(test)]
mod cron_utils_tests {
    use queuer_dispatcher::cron_utils::*;

    use chrono::{Datelike, Duration, TimeZone, Timelike, Utc, Weekday};

    #[test]
    fn test_five_and_six_field_forms() {
        assert!(CronScheduler::new("*/5 * * * *").is_ok());
        assert!(CronScheduler::new("0 */5 * * * *").is_ok());
        assert!(CronScheduler::new("0 0 9 * * * 2030").is_ok());
        assert!(CronScheduler::new("invalid").is_err());
        assert!(CronScheduler::new("").is_err());
    }

    #[test]
    fn test_expression_is_kept_as_written() {
        let scheduler = CronScheduler::new("30 2 * * *").unwrap();
        assert_eq!(scheduler.expression(), "30 2 * * *");
    }

    #[test]
    fn test_daily_expression() {
        let scheduler = CronScheduler::new("0 0 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = scheduler.next_execution_time(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_weekday_range() {
        // 2024-01-06 是周六
        let scheduler = CronScheduler::new("0 9 * * Mon-Fri").unwrap();
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 10, 0, 0).unwrap();
        let next = scheduler.next_execution_time(saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!((next.hour(), next.minute()), (9, 0));
    }

    #[test]
    fn test_upcoming_times_are_hourly() {
        let scheduler = CronScheduler::new("0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();
        let upcoming = scheduler.upcoming_times(now, 3);

        let hours: Vec<u32> = upcoming.iter().map(|t| t.hour()).collect();
        assert_eq!(hours, vec![13, 14, 15]);
        assert!(upcoming.windows(2).all(|w| w[1] - w[0] == Duration::hours(1)));
    }

    #[test]
    fn test_time_until_next_execution() {
        let scheduler = CronScheduler::new("0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();
        let until = scheduler.time_until_next_execution(now).unwrap();
        assert_eq!(until.num_minutes(), 30);
    }

    #[test]
    fn test_invalid_fields_are_rejected() {
        assert!(CronScheduler::validate_cron_expression("0 0 32 * *").is_err());
        assert!(CronScheduler::validate_cron_expression("0 25 * * *").is_err());
        assert!(CronScheduler::validate_cron_expression("0 9-17 * * 1-5").is_ok());
    }

    #[test]
    fn test_normalize_passes_through_longer_forms() {
        assert_eq!(normalize_expression("0 0 * * * * 2030"), "0 0 * * * * 2030");
        assert_eq!(normalize_expression("15 10 * * *"), "0 15 10 * * *");
    }
}
