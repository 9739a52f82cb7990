//! 时钟与“配额日”边界。
//!
//! 上游配额按太平洋时间（America/Los_Angeles）午夜重置，与服务器所在时区无关。

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::America::Los_Angeles;
use std::fmt::Debug;

/// 可注入的时间源：生产环境使用系统时间，测试中可替换为手动推进的时钟。
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 给定时刻在参考时区下的日历日期。
pub fn reference_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Los_Angeles).date_naive()
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn reference_date_uses_pacific_time() {
        // 2024-03-02 07:59 UTC = 2024-03-01 23:59 PST
        let before = Utc.with_ymd_and_hms(2024, 3, 2, 7, 59, 0).unwrap();
        // 2024-03-02 08:00 UTC = 2024-03-02 00:00 PST
        let after = Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap();

        assert_eq!(
            reference_date(before),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
        assert_eq!(
            reference_date(after),
            NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()
        );
    }

    #[test]
    fn reference_date_follows_daylight_saving() {
        // 夏令时（PDT, UTC-7）：07:00 UTC 已是当地午夜。
        let t = Utc.with_ymd_and_hms(2024, 7, 10, 7, 0, 0).unwrap();
        assert_eq!(
            reference_date(t),
            NaiveDate::from_ymd_opt(2024, 7, 10).unwrap()
        );
        let t = Utc.with_ymd_and_hms(2024, 7, 10, 6, 59, 59).unwrap();
        assert_eq!(
            reference_date(t),
            NaiveDate::from_ymd_opt(2024, 7, 9).unwrap()
        );
    }
}
